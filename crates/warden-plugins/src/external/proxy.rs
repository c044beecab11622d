//! Proxy that makes an out-of-process plugin server look like a local plugin.
//!
//! Each hook call becomes a `tools/call` request whose tool name is the hook
//! type and whose arguments carry the plugin name, payload and call context.
//! The server answers with a text content item holding JSON:
//!
//! ```json
//! {"result": {"continue_processing": true, "metadata": {}},
//!  "context": {"state": {}, "global_state": {}}}
//! ```
//!
//! or `{"error": {"message": "...", "code": "..."}}` when the plugin itself failed.
//!
//! During `initialize` the proxy asks the server for its own entry for the
//! plugin (`get_plugin_config`); the registry fills locally unset fields
//! from it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use warden_types::config::RemotePluginConfig;
use warden_types::context::PluginCallContext;
use warden_types::errors::WardenError;
use warden_types::hooks::{HookPayload, HookType, PluginResult};
use warden_types::outcome::{HealthMetrics, HealthState};
use warden_types::traits::Plugin;
use warden_types::wire::{
    ARG_CONTEXT, ARG_NAME, ARG_PAYLOAD, ARG_PLUGIN_NAME, METHOD_PING, METHOD_TOOLS_CALL,
    REPLY_CONTEXT, REPLY_ERROR, REPLY_RESULT, TOOL_GET_PLUGIN_CONFIG,
};

use super::health::HealthTracker;
use super::transport_http::McpHttpTransport;

/// A remote plugin reached over the streamable HTTP transport.
pub struct ExternalPluginProxy {
    name: String,
    transport: McpHttpTransport,
    health: Mutex<HealthTracker>,
    outbound_calls: AtomicU64,
    /// The server's entry for this plugin, fetched by `initialize`.
    remote_config: OnceLock<RemotePluginConfig>,
}

impl ExternalPluginProxy {
    pub fn new(name: impl Into<String>, transport: McpHttpTransport, health: HealthTracker) -> Self {
        Self {
            name: name.into(),
            transport,
            health: Mutex::new(health),
            outbound_calls: AtomicU64::new(0),
            remote_config: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health_state(&self) -> HealthState {
        self.tracker().state()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        self.tracker().metrics()
    }

    /// Number of hook calls sent to the server.
    pub fn outbound_calls(&self) -> u64 {
        self.outbound_calls.load(Ordering::Relaxed)
    }

    /// The server's entry for this plugin, once `initialize` has run.
    pub fn remote_config(&self) -> Option<&RemotePluginConfig> {
        self.remote_config.get()
    }

    /// Ask the server for its entry for this plugin.
    pub async fn fetch_config(&self) -> Result<RemotePluginConfig, WardenError> {
        let params = json!({
            "name": TOOL_GET_PLUGIN_CONFIG,
            "arguments": { ARG_NAME: self.name },
        });
        let result = self.transport.request(METHOD_TOOLS_CALL, params).await?;
        let mut entry = Value::Object(self.reply_object(result)?);
        // Servers send unset fields as null.
        strip_nulls(&mut entry);
        serde_json::from_value(entry).map_err(|e| {
            WardenError::PluginProtocol(format!(
                "plugin '{}' server returned an invalid configuration: {e}",
                self.name
            ))
        })
    }

    /// Send one liveness probe and update health. Returns the resulting state.
    pub async fn probe(&self) -> HealthState {
        match self.transport.request(METHOD_PING, json!({})).await {
            Ok(_) => {
                let transition = self.tracker().record_probe_success();
                if let Some(state) = transition {
                    tracing::info!(
                        plugin = %self.name,
                        state = ?state,
                        "external plugin is healthy"
                    );
                }
            }
            Err(e) => {
                tracing::debug!(plugin = %self.name, error = %e, "health probe failed");
                self.record_failure();
            }
        }
        self.health_state()
    }

    /// Probe every `interval` until `shutdown` flips to `true` or its sender
    /// is dropped. The first probe runs one interval after start.
    pub fn spawn_health_checks(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // An in-flight check must not hold up shutdown.
                        tokio::select! {
                            _ = self.probe() => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(plugin = %self.name, "health check loop stopped");
        })
    }

    fn tracker(&self) -> MutexGuard<'_, HealthTracker> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_failure(&self) {
        let transition = self.tracker().record_failure();
        if let Some(state) = transition {
            tracing::warn!(
                plugin = %self.name,
                state = ?state,
                "external plugin marked unhealthy"
            );
        }
    }

    fn record_call_success(&self) {
        let transition = self.tracker().record_call_success();
        if let Some(state) = transition {
            tracing::info!(plugin = %self.name, state = ?state, "external plugin is healthy");
        }
    }

    /// Extract the JSON reply object from a `tools/call` result.
    fn reply_object(&self, result: Value) -> Result<serde_json::Map<String, Value>, WardenError> {
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            })
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str);

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(WardenError::PluginExecution(format!(
                "plugin '{}' reported an error: {}",
                self.name,
                text.unwrap_or("no details")
            )));
        }

        if let Some(Value::Object(structured)) = result.get("structuredContent") {
            return Ok(structured.clone());
        }

        let text = text.ok_or_else(|| {
            WardenError::PluginProtocol(format!(
                "plugin '{}' returned no text content",
                self.name
            ))
        })?;
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(obj)) => Ok(obj),
            Ok(_) => Err(WardenError::PluginProtocol(format!(
                "plugin '{}' reply is not a JSON object",
                self.name
            ))),
            Err(e) => Err(WardenError::PluginProtocol(format!(
                "plugin '{}' reply is not valid JSON: {e}",
                self.name
            ))),
        }
    }

    async fn call(
        &self,
        hook: HookType,
        payload: HookPayload,
        ctx: &mut PluginCallContext,
    ) -> Result<PluginResult, WardenError> {
        let params = json!({
            "name": hook.as_str(),
            "arguments": {
                ARG_PLUGIN_NAME: self.name,
                ARG_PAYLOAD: payload.to_wire()?,
                ARG_CONTEXT: ctx.to_wire(),
            },
        });

        self.outbound_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.transport.request(METHOD_TOOLS_CALL, params).await?;
        let mut reply = self.reply_object(result)?;

        if let Some(error) = reply.remove(REPLY_ERROR).filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(WardenError::PluginExecution(format!(
                "plugin '{}' failed: {message}",
                self.name
            )));
        }

        if let Some(context) = reply.remove(REPLY_CONTEXT).filter(|c| !c.is_null()) {
            ctx.apply_remote(context)?;
        }

        let result = reply.remove(REPLY_RESULT).ok_or_else(|| {
            WardenError::PluginProtocol(format!(
                "plugin '{}' reply has neither result nor error",
                self.name
            ))
        })?;
        PluginResult::from_wire(hook, result).map_err(|e| {
            WardenError::PluginProtocol(format!(
                "plugin '{}' returned a malformed result: {e}",
                self.name
            ))
        })
    }
}

#[async_trait]
impl Plugin for ExternalPluginProxy {
    async fn initialize(&self) -> Result<(), WardenError> {
        let remote = self.fetch_config().await?;
        tracing::info!(
            plugin = %self.name,
            endpoint = %self.transport.endpoint(),
            remote_hooks = remote.hooks.len(),
            "registered external plugin"
        );
        if self.remote_config.set(remote).is_err() {
            tracing::debug!(plugin = %self.name, "already initialized, keeping first config");
        }
        Ok(())
    }

    async fn invoke(
        &self,
        hook: HookType,
        payload: HookPayload,
        ctx: &mut PluginCallContext,
    ) -> Result<PluginResult, WardenError> {
        if !self.tracker().try_begin_call() {
            return Err(WardenError::PluginProtocol(format!(
                "plugin '{}' is unhealthy",
                self.name
            )));
        }

        match self.call(hook, payload, ctx).await {
            Ok(result) => {
                self.record_call_success();
                Ok(result)
            }
            Err(e) => {
                match &e {
                    WardenError::PluginProtocol(_) => self.record_failure(),
                    // Counted once, through `record_timeout`.
                    WardenError::PluginTimeout(_) => {}
                    // The server answered; only the plugin's own code failed.
                    _ => self.record_call_success(),
                }
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> Result<(), WardenError> {
        self.transport.close().await;
        Ok(())
    }

    fn health(&self) -> Option<HealthState> {
        Some(self.health_state())
    }

    fn accepts_calls(&self) -> bool {
        self.tracker().allows_calls()
    }

    fn record_timeout(&self) {
        tracing::debug!(plugin = %self.name, "call timed out");
        self.record_failure();
    }
}

/// Remove null-valued object entries, recursively.
fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::external::transport_http::tests::{mount_handshake, test_config, RpcReply};
    use warden_types::context::{CallIdentity, CallScope, PluginContext};
    use warden_types::hooks::ToolPreInvokePayload;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn tool_call_reply(reply: Value) -> RpcReply {
        RpcReply::json(json!({
            "content": [{"type": "text", "text": reply.to_string()}],
            "isError": false,
        }))
    }

    fn payload() -> HookPayload {
        HookPayload::ToolPreInvoke(ToolPreInvokePayload {
            name: "send_email".to_string(),
            ..Default::default()
        })
    }

    fn proxy(server: &MockServer, threshold: u32) -> ExternalPluginProxy {
        proxy_with(server, HealthTracker::new(threshold))
    }

    fn proxy_with(server: &MockServer, health: HealthTracker) -> ExternalPluginProxy {
        let transport = McpHttpTransport::new(test_config(server)).unwrap();
        ExternalPluginProxy::new("remote", transport, health)
    }

    /// Serve `entry` as the server's configuration for plugin `name`.
    pub(crate) async fn mount_plugin_config(server: &MockServer, name: &str, entry: Value) {
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({
                "method": "tools/call",
                "params": {"name": "get_plugin_config", "arguments": {"name": name}}
            })))
            .respond_with(tool_call_reply(entry))
            .mount(server)
            .await;
    }

    fn call_ctx() -> PluginCallContext {
        PluginContext::new(CallIdentity::default()).call_context(
            "remote",
            HookType::ToolPreInvoke,
            CallScope::default(),
        )
    }

    async fn mount_tool_call(server: &MockServer, reply: RpcReply) {
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({
                "method": "tools/call",
                "params": {"name": "tool_pre_invoke", "arguments": {"plugin_name": "remote"}}
            })))
            .respond_with(reply)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_invoke_decodes_result_and_context() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        mount_tool_call(
            &server,
            tool_call_reply(json!({
                "result": {
                    "continue_processing": true,
                    "modified_payload": {"name": "send_email", "args": {"to": "redacted"}},
                    "metadata": {"scanned": true}
                },
                "context": {"state": {"calls": 1}, "global_state": {"flag": "set"}}
            })),
        )
        .await;

        let proxy = proxy(&server, 3);
        let mut ctx = call_ctx();
        let result = proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut ctx)
            .await
            .unwrap();

        assert!(result.continue_processing);
        assert_eq!(result.metadata["scanned"], json!(true));
        match result.modified_payload {
            Some(HookPayload::ToolPreInvoke(p)) => assert_eq!(p.args["to"], json!("redacted")),
            other => panic!("expected tool payload, got {other:?}"),
        }
        assert_eq!(ctx.get_state("calls"), Some(&json!(1)));
        assert_eq!(ctx.get_global("flag"), Some(&json!("set")));
        assert_eq!(proxy.outbound_calls(), 1);
        assert_eq!(proxy.health_state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_remote_error_is_execution_error_not_health_failure() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        mount_tool_call(
            &server,
            tool_call_reply(json!({"error": {"message": "regex exploded", "code": "E1"}})),
        )
        .await;

        let proxy = proxy(&server, 1);
        let err = proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
            .await
            .unwrap_err();
        match err {
            WardenError::PluginExecution(msg) => assert!(msg.contains("regex exploded")),
            other => panic!("expected execution error, got {other:?}"),
        }
        assert!(proxy.tracker().allows_calls());
    }

    #[tokio::test]
    async fn test_garbage_reply_is_protocol_error() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        mount_tool_call(
            &server,
            RpcReply::json(json!({"content": [{"type": "text", "text": "not json"}]})),
        )
        .await;

        let proxy = proxy(&server, 3);
        let err = proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::PluginProtocol(_)));
        assert_eq!(proxy.health_metrics().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_result_of_wrong_variant_is_protocol_error() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        mount_tool_call(
            &server,
            tool_call_reply(json!({"result": {"modified_payload": {"uri": "file:///etc"}}})),
        )
        .await;

        let proxy = proxy(&server, 3);
        let err = proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::PluginProtocol(_)));
    }

    #[tokio::test]
    async fn test_failed_probes_mark_unhealthy_and_block_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let proxy = proxy(&server, 2);
        assert_eq!(proxy.probe().await, HealthState::Unknown);
        assert_eq!(proxy.probe().await, HealthState::Unhealthy);

        let before = server.received_requests().await.unwrap().len();
        let err = proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::PluginProtocol(_)));
        assert_eq!(server.received_requests().await.unwrap().len(), before);
        assert_eq!(proxy.outbound_calls(), 0);
    }

    #[tokio::test]
    async fn test_successful_probe_recovers() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({"method": "ping"})))
            .respond_with(RpcReply::json(json!({})))
            .mount(&server)
            .await;

        let proxy = proxy(&server, 1);
        proxy.record_timeout();
        assert_eq!(proxy.health_state(), HealthState::Unhealthy);

        assert_eq!(proxy.probe().await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_health_loop_stops_on_shutdown() {
        let server = MockServer::start().await;
        let proxy = Arc::new(proxy(&server, 3));
        let (tx, rx) = watch::channel(false);

        let handle = proxy.clone().spawn_health_checks(Duration::from_secs(60), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        // No probe ran: the first tick is one interval after start.
        assert_eq!(proxy.health_state(), HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_health_loop_shutdown_does_not_wait_for_slow_check() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let proxy = Arc::new(proxy(&server, 3));
        let (tx, rx) = watch::channel(false);
        let handle = proxy
            .clone()
            .spawn_health_checks(Duration::from_millis(20), rx);

        // Let the first check start and hang on the server.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.received_requests().await.unwrap().is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop without waiting for the check")
            .unwrap();
    }

    #[tokio::test]
    async fn test_trial_call_recovers_when_probing_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let health = HealthTracker::new(3).with_retry_after(Duration::from_millis(100));
        let proxy = proxy_with(&server, health);
        for _ in 0..3 {
            let err = proxy
                .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
                .await
                .unwrap_err();
            assert!(matches!(err, WardenError::PluginProtocol(_)));
        }
        assert_eq!(proxy.health_state(), HealthState::Unhealthy);
        assert!(!proxy.accepts_calls());

        // The server comes back.
        server.reset().await;
        mount_handshake(&server).await;
        mount_tool_call(
            &server,
            tool_call_reply(json!({"result": {"continue_processing": true}})),
        )
        .await;

        // Still inside the cooldown: nothing is sent.
        assert!(proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
            .await
            .is_err());
        assert!(server.received_requests().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(proxy.accepts_calls());
        let result = proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
            .await
            .unwrap();
        assert!(result.continue_processing);
        assert_eq!(proxy.health_state(), HealthState::Healthy);

        proxy
            .invoke(HookType::ToolPreInvoke, payload(), &mut call_ctx())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_initialize_fetches_server_config() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        mount_plugin_config(
            &server,
            "remote",
            json!({
                "name": "remote",
                "kind": "plugins.pii.PiiFilter",
                "description": null,
                "hooks": ["tool_pre_invoke"],
                "priority": 15,
                "conditions": [{"server_ids": null, "tools": ["send_email"]}],
                "config": null
            }),
        )
        .await;

        let proxy = proxy(&server, 3);
        assert!(proxy.remote_config().is_none());
        proxy.initialize().await.unwrap();

        let remote = proxy.remote_config().unwrap();
        assert_eq!(remote.hooks, vec![HookType::ToolPreInvoke]);
        assert_eq!(remote.priority, Some(15));
        assert_eq!(remote.conditions[0].tools, vec!["send_email".to_string()]);
        assert!(remote.conditions[0].server_ids.is_empty());
        assert!(remote.config.is_empty());
        assert_eq!(proxy.outbound_calls(), 0);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_server_has_no_entry() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(RpcReply::json(json!({
                "content": [{"type": "text", "text": "null"}],
                "isError": false,
            })))
            .mount(&server)
            .await;

        let proxy = proxy(&server, 3);
        let err = proxy.initialize().await.unwrap_err();
        assert!(matches!(err, WardenError::PluginProtocol(_)));
        assert!(proxy.remote_config().is_none());
    }
}
