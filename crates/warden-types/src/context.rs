/// Per-request context bag and the per-call view each plugin receives.
///
/// A [`PluginContext`] is created when a request enters the gateway and
/// dropped when it leaves. It is owned by that request and passed explicitly
/// into every dispatch; nothing here is process-wide.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::errors::WardenError;
use crate::hooks::HookType;

/// Who and where a request comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// Metadata one plugin contributed during one hook call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataContribution {
    pub plugin_name: String,
    pub hook: HookType,
    pub metadata: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Request-scoped state shared across every hook of one request.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub request_id: Uuid,
    pub identity: CallIdentity,
    /// Bucket visible to every plugin in every band of this request.
    pub global_state: Map<String, Value>,
    /// Private bucket per plugin name.
    pub plugin_states: HashMap<String, Map<String, Value>>,
    /// Append-only record of metadata contributions.
    pub audit_trail: Vec<MetadataContribution>,
}

impl PluginContext {
    pub fn new(identity: CallIdentity) -> Self {
        Self::with_request_id(Uuid::new_v4(), identity)
    }

    /// Create a context for a request id assigned upstream.
    pub fn with_request_id(request_id: Uuid, identity: CallIdentity) -> Self {
        Self {
            request_id,
            identity,
            global_state: Map::new(),
            plugin_states: HashMap::new(),
            audit_trail: Vec::new(),
        }
    }

    /// Build the view handed to `plugin_name` for one call.
    pub fn call_context(
        &self,
        plugin_name: &str,
        hook: HookType,
        scope: CallScope,
    ) -> PluginCallContext {
        PluginCallContext {
            request_id: self.request_id,
            identity: self.identity.clone(),
            hook,
            plugin_name: plugin_name.to_string(),
            global: self.global_state.clone(),
            global_writes: Map::new(),
            state: self
                .plugin_states
                .get(plugin_name)
                .cloned()
                .unwrap_or_default(),
            scope,
        }
    }

    /// Fold a finished call's writes back into the request context.
    ///
    /// Callers apply call contexts in registration order, so concurrent
    /// writes to the same global key resolve to the last registered writer.
    pub fn absorb(&mut self, call: PluginCallContext) {
        for (key, value) in call.global_writes {
            self.global_state.insert(key, value);
        }
        if call.state.is_empty() && !self.plugin_states.contains_key(&call.plugin_name) {
            return;
        }
        self.plugin_states.insert(call.plugin_name, call.state);
    }

    /// Append a metadata contribution; empty maps are not recorded.
    pub fn record_metadata(
        &mut self,
        plugin_name: &str,
        hook: HookType,
        metadata: Map<String, Value>,
    ) {
        if metadata.is_empty() {
            return;
        }
        self.audit_trail.push(MetadataContribution {
            plugin_name: plugin_name.to_string(),
            hook,
            metadata,
            recorded_at: Utc::now(),
        });
    }

    /// All metadata a given plugin contributed, oldest first.
    pub fn metadata_for<'a>(
        &'a self,
        plugin_name: &'a str,
    ) -> impl Iterator<Item = &'a Map<String, Value>> + 'a {
        self.audit_trail
            .iter()
            .filter(move |entry| entry.plugin_name == plugin_name)
            .map(|entry| &entry.metadata)
    }
}

/// Match-derived settings for one call: rule/target extensions and
/// the payload paths the plugin was told to inspect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallScope {
    #[serde(default)]
    pub extensions: Map<String, Value>,
    #[serde(default)]
    pub context_paths: Vec<String>,
}

/// The context one plugin sees during one hook call.
///
/// Global reads see the snapshot taken at band entry plus this plugin's own
/// writes. Writes are buffered and applied by the dispatcher after the band.
#[derive(Debug, Clone)]
pub struct PluginCallContext {
    pub request_id: Uuid,
    pub identity: CallIdentity,
    pub hook: HookType,
    pub plugin_name: String,
    global: Map<String, Value>,
    global_writes: Map<String, Value>,
    state: Map<String, Value>,
    pub scope: CallScope,
}

impl PluginCallContext {
    pub fn get_global(&self, key: &str) -> Option<&Value> {
        self.global_writes.get(key).or_else(|| self.global.get(key))
    }

    pub fn set_global(&mut self, key: impl Into<String>, value: Value) {
        self.global_writes.insert(key.into(), value);
    }

    /// Global keys written during this call.
    pub fn global_writes(&self) -> &Map<String, Value> {
        &self.global_writes
    }

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    /// Serialize for an external plugin call.
    pub fn to_wire(&self) -> Value {
        let mut global = self.global.clone();
        for (key, value) in &self.global_writes {
            global.insert(key.clone(), value.clone());
        }
        json!({
            "request_id": self.request_id.to_string(),
            "user": self.identity.user,
            "tenant_id": self.identity.tenant_id,
            "server_id": self.identity.server_id,
            "hook": self.hook,
            "plugin_name": self.plugin_name,
            "state": self.state,
            "global_state": global,
            "extensions": self.scope.extensions,
            "context_paths": self.scope.context_paths,
        })
    }

    /// Apply a context object returned by an external plugin.
    ///
    /// `state` replaces the private bucket. Keys in `global_state` whose
    /// value differs from what the plugin was sent become global writes.
    pub fn apply_remote(&mut self, context: Value) -> Result<(), WardenError> {
        let Value::Object(mut obj) = context else {
            return Err(WardenError::PluginProtocol(
                "plugin context must be a JSON object".to_string(),
            ));
        };
        match obj.remove("state") {
            Some(Value::Object(state)) => self.state = state,
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(WardenError::PluginProtocol(
                    "plugin context 'state' must be an object".to_string(),
                ))
            }
        }
        match obj.remove("global_state") {
            Some(Value::Object(global)) => {
                for (key, value) in global {
                    if self.get_global(&key) != Some(&value) {
                        self.global_writes.insert(key, value);
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(WardenError::PluginProtocol(
                    "plugin context 'global_state' must be an object".to_string(),
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PluginContext {
        PluginContext::new(CallIdentity {
            user: Some("alice@example.com".to_string()),
            tenant_id: Some("acme".to_string()),
            server_id: None,
        })
    }

    #[test]
    fn test_call_context_sees_snapshot_and_own_writes() {
        let mut ctx = ctx();
        ctx.global_state.insert("seen".to_string(), json!(1));

        let mut call = ctx.call_context("a", HookType::ToolPreInvoke, CallScope::default());
        assert_eq!(call.get_global("seen"), Some(&json!(1)));
        call.set_global("seen", json!(2));
        assert_eq!(call.get_global("seen"), Some(&json!(2)));

        // Not visible in the request context until absorbed.
        assert_eq!(ctx.global_state["seen"], json!(1));
        ctx.absorb(call);
        assert_eq!(ctx.global_state["seen"], json!(2));
    }

    #[test]
    fn test_private_state_persists_across_calls() {
        let mut ctx = ctx();
        let mut call = ctx.call_context("a", HookType::ToolPreInvoke, CallScope::default());
        call.set_state("count", json!(1));
        ctx.absorb(call);

        let call = ctx.call_context("a", HookType::ToolPostInvoke, CallScope::default());
        assert_eq!(call.get_state("count"), Some(&json!(1)));

        let other = ctx.call_context("b", HookType::ToolPostInvoke, CallScope::default());
        assert!(other.get_state("count").is_none());
    }

    #[test]
    fn test_absorb_in_order_is_last_write_wins() {
        let mut ctx = ctx();
        let mut first = ctx.call_context("a", HookType::ToolPreInvoke, CallScope::default());
        let mut second = ctx.call_context("b", HookType::ToolPreInvoke, CallScope::default());
        first.set_global("k", json!("a"));
        second.set_global("k", json!("b"));
        ctx.absorb(first);
        ctx.absorb(second);
        assert_eq!(ctx.global_state["k"], json!("b"));
    }

    #[test]
    fn test_empty_metadata_not_recorded() {
        let mut ctx = ctx();
        ctx.record_metadata("a", HookType::ToolPreInvoke, Map::new());
        assert!(ctx.audit_trail.is_empty());

        let mut meta = Map::new();
        meta.insert("hits".to_string(), json!(2));
        ctx.record_metadata("a", HookType::ToolPreInvoke, meta);
        assert_eq!(ctx.metadata_for("a").count(), 1);
        assert_eq!(ctx.metadata_for("b").count(), 0);
    }

    #[test]
    fn test_wire_context_carries_identity_and_scope() {
        let ctx = ctx();
        let mut scope = CallScope::default();
        scope.extensions.insert("strict".to_string(), json!(true));
        scope.context_paths.push("args.body".to_string());
        let call = ctx.call_context("pii", HookType::ToolPreInvoke, scope);

        let wire = call.to_wire();
        assert_eq!(wire["user"], "alice@example.com");
        assert_eq!(wire["tenant_id"], "acme");
        assert_eq!(wire["hook"], "tool_pre_invoke");
        assert_eq!(wire["extensions"]["strict"], true);
        assert_eq!(wire["context_paths"][0], "args.body");
    }

    #[test]
    fn test_apply_remote_records_only_changed_globals() {
        let mut ctx = ctx();
        ctx.global_state.insert("unchanged".to_string(), json!(1));
        let mut call = ctx.call_context("ext", HookType::ToolPreInvoke, CallScope::default());

        call.apply_remote(json!({
            "state": {"calls": 3},
            "global_state": {"unchanged": 1, "added": "x"}
        }))
        .unwrap();

        assert_eq!(call.get_state("calls"), Some(&json!(3)));
        assert_eq!(call.global_writes().len(), 1);
        assert_eq!(call.global_writes()["added"], json!("x"));
    }

    #[test]
    fn test_apply_remote_rejects_non_object() {
        let mut call = ctx().call_context("ext", HookType::ToolPreInvoke, CallScope::default());
        let err = call.apply_remote(json!([1, 2])).unwrap_err();
        assert!(matches!(err, WardenError::PluginProtocol(_)));
    }
}
