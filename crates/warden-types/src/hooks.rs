/// Hook types, per-hook payloads, and plugin results.
///
/// Every hook point in the gateway has exactly one payload shape. The
/// [`HookPayload`] tagged union keeps the variant fixed for the lifetime of a
/// dispatch: results coming back from plugins are decoded against the hook
/// type, so a plugin can never swap one payload shape for another.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{PolicyDenial, WardenError};

/// HTTP header map passed through request/auth hooks.
pub type HttpHeaders = BTreeMap<String, String>;

// ============================================================
// Hook Types
// ============================================================

/// Closed set of hook points a plugin can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    /// Before a prompt template is fetched and rendered.
    PromptPreFetch,
    /// After a prompt has been rendered.
    PromptPostFetch,
    /// Before a tool is invoked on its backend.
    ToolPreInvoke,
    /// After a tool returned its result.
    ToolPostInvoke,
    /// Before a resource is fetched.
    ResourcePreFetch,
    /// After a resource has been fetched.
    ResourcePostFetch,
    /// Middleware hook before request processing (header transforms).
    HttpPreRequest,
    /// Middleware hook after the response was produced.
    HttpPostRequest,
    /// Custom user authentication.
    HttpAuthResolveUser,
    /// Custom permission checks ahead of RBAC.
    HttpAuthCheckPermission,
}

impl HookType {
    /// All hook types, in lifecycle order.
    pub const ALL: [HookType; 10] = [
        HookType::PromptPreFetch,
        HookType::PromptPostFetch,
        HookType::ToolPreInvoke,
        HookType::ToolPostInvoke,
        HookType::ResourcePreFetch,
        HookType::ResourcePostFetch,
        HookType::HttpPreRequest,
        HookType::HttpPostRequest,
        HookType::HttpAuthResolveUser,
        HookType::HttpAuthCheckPermission,
    ];

    /// Wire name of the hook (also the external plugin method name).
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::PromptPreFetch => "prompt_pre_fetch",
            HookType::PromptPostFetch => "prompt_post_fetch",
            HookType::ToolPreInvoke => "tool_pre_invoke",
            HookType::ToolPostInvoke => "tool_post_invoke",
            HookType::ResourcePreFetch => "resource_pre_fetch",
            HookType::ResourcePostFetch => "resource_post_fetch",
            HookType::HttpPreRequest => "http_pre_request",
            HookType::HttpPostRequest => "http_post_request",
            HookType::HttpAuthResolveUser => "http_auth_resolve_user",
            HookType::HttpAuthCheckPermission => "http_auth_check_permission",
        }
    }

    /// Which kind of named target this hook operates on, if any.
    ///
    /// HTTP hooks have no matchable target name.
    pub fn target_kind(&self) -> Option<TargetKind> {
        match self {
            HookType::ToolPreInvoke | HookType::ToolPostInvoke => Some(TargetKind::Tool),
            HookType::PromptPreFetch | HookType::PromptPostFetch => Some(TargetKind::Prompt),
            HookType::ResourcePreFetch | HookType::ResourcePostFetch => {
                Some(TargetKind::Resource)
            }
            _ => None,
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookType::ALL
            .iter()
            .copied()
            .find(|hook| hook.as_str() == s)
            .ok_or_else(|| WardenError::Config(format!("unknown hook type '{s}'")))
    }
}

/// Category of the named entity a hook call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Tool,
    Prompt,
    Resource,
}

// ============================================================
// Payloads
// ============================================================

/// Prompt pre-fetch: the prompt id and its template arguments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptPreFetchPayload {
    pub prompt_id: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// Prompt post-fetch: the rendered prompt result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptPostFetchPayload {
    pub prompt_id: String,
    #[serde(default)]
    pub result: Value,
}

/// Tool pre-invoke: tool name, call arguments and pass-through headers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolPreInvokePayload {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HttpHeaders>,
}

/// Tool post-invoke: tool name and the backend's result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolPostInvokePayload {
    pub name: String,
    #[serde(default)]
    pub result: Value,
}

/// Resource pre-fetch: the URI plus request metadata and headers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourcePreFetchPayload {
    pub uri: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HttpHeaders>,
}

/// Resource post-fetch: the URI and fetched content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourcePostFetchPayload {
    pub uri: String,
    #[serde(default)]
    pub content: Value,
}

/// HTTP pre-request: immutable request metadata and a mutable header copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpPreRequestPayload {
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default)]
    pub headers: HttpHeaders,
}

/// HTTP post-request: the request fields plus response status and headers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpPostRequestPayload {
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default)]
    pub headers: HttpHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HttpHeaders>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Custom authentication: raw credentials and request headers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpAuthResolveUserPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    #[serde(default)]
    pub headers: HttpHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
}

/// Permission check ahead of RBAC evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpAuthCheckPermissionPayload {
    pub user_email: String,
    pub permission: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Tagged union of all hook payloads, one variant per [`HookType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hook", content = "payload", rename_all = "snake_case")]
pub enum HookPayload {
    PromptPreFetch(PromptPreFetchPayload),
    PromptPostFetch(PromptPostFetchPayload),
    ToolPreInvoke(ToolPreInvokePayload),
    ToolPostInvoke(ToolPostInvokePayload),
    ResourcePreFetch(ResourcePreFetchPayload),
    ResourcePostFetch(ResourcePostFetchPayload),
    HttpPreRequest(HttpPreRequestPayload),
    HttpPostRequest(HttpPostRequestPayload),
    HttpAuthResolveUser(HttpAuthResolveUserPayload),
    HttpAuthCheckPermission(HttpAuthCheckPermissionPayload),
}

impl HookPayload {
    /// The hook this payload belongs to.
    pub fn hook_type(&self) -> HookType {
        match self {
            HookPayload::PromptPreFetch(_) => HookType::PromptPreFetch,
            HookPayload::PromptPostFetch(_) => HookType::PromptPostFetch,
            HookPayload::ToolPreInvoke(_) => HookType::ToolPreInvoke,
            HookPayload::ToolPostInvoke(_) => HookType::ToolPostInvoke,
            HookPayload::ResourcePreFetch(_) => HookType::ResourcePreFetch,
            HookPayload::ResourcePostFetch(_) => HookType::ResourcePostFetch,
            HookPayload::HttpPreRequest(_) => HookType::HttpPreRequest,
            HookPayload::HttpPostRequest(_) => HookType::HttpPostRequest,
            HookPayload::HttpAuthResolveUser(_) => HookType::HttpAuthResolveUser,
            HookPayload::HttpAuthCheckPermission(_) => HookType::HttpAuthCheckPermission,
        }
    }

    /// The tool name, prompt id, or resource URI this call targets.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            HookPayload::PromptPreFetch(p) => Some(&p.prompt_id),
            HookPayload::PromptPostFetch(p) => Some(&p.prompt_id),
            HookPayload::ToolPreInvoke(p) => Some(&p.name),
            HookPayload::ToolPostInvoke(p) => Some(&p.name),
            HookPayload::ResourcePreFetch(p) => Some(&p.uri),
            HookPayload::ResourcePostFetch(p) => Some(&p.uri),
            _ => None,
        }
    }

    /// Serialize the inner payload object without the variant tag.
    ///
    /// This is the body external plugins receive; the hook type travels
    /// separately as the method name.
    pub fn to_wire(&self) -> Result<Value, WardenError> {
        let value = match self {
            HookPayload::PromptPreFetch(p) => serde_json::to_value(p)?,
            HookPayload::PromptPostFetch(p) => serde_json::to_value(p)?,
            HookPayload::ToolPreInvoke(p) => serde_json::to_value(p)?,
            HookPayload::ToolPostInvoke(p) => serde_json::to_value(p)?,
            HookPayload::ResourcePreFetch(p) => serde_json::to_value(p)?,
            HookPayload::ResourcePostFetch(p) => serde_json::to_value(p)?,
            HookPayload::HttpPreRequest(p) => serde_json::to_value(p)?,
            HookPayload::HttpPostRequest(p) => serde_json::to_value(p)?,
            HookPayload::HttpAuthResolveUser(p) => serde_json::to_value(p)?,
            HookPayload::HttpAuthCheckPermission(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Decode a bare payload object as the variant belonging to `hook`.
    pub fn from_wire(hook: HookType, value: Value) -> Result<Self, WardenError> {
        let payload = match hook {
            HookType::PromptPreFetch => HookPayload::PromptPreFetch(serde_json::from_value(value)?),
            HookType::PromptPostFetch => {
                HookPayload::PromptPostFetch(serde_json::from_value(value)?)
            }
            HookType::ToolPreInvoke => HookPayload::ToolPreInvoke(serde_json::from_value(value)?),
            HookType::ToolPostInvoke => HookPayload::ToolPostInvoke(serde_json::from_value(value)?),
            HookType::ResourcePreFetch => {
                HookPayload::ResourcePreFetch(serde_json::from_value(value)?)
            }
            HookType::ResourcePostFetch => {
                HookPayload::ResourcePostFetch(serde_json::from_value(value)?)
            }
            HookType::HttpPreRequest => HookPayload::HttpPreRequest(serde_json::from_value(value)?),
            HookType::HttpPostRequest => {
                HookPayload::HttpPostRequest(serde_json::from_value(value)?)
            }
            HookType::HttpAuthResolveUser => {
                HookPayload::HttpAuthResolveUser(serde_json::from_value(value)?)
            }
            HookType::HttpAuthCheckPermission => {
                HookPayload::HttpAuthCheckPermission(serde_json::from_value(value)?)
            }
        };
        Ok(payload)
    }
}

// ============================================================
// Plugin Results
// ============================================================

/// Structured policy-breach signal reported by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginViolation {
    /// Short reason, safe to show to clients.
    pub reason: String,
    /// Longer description for operators.
    #[serde(default)]
    pub description: String,
    /// Machine-readable code.
    pub code: String,
    /// Free-form structured details.
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Name of the reporting plugin; stamped by the dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
}

impl PluginViolation {
    pub fn new(
        code: impl Into<String>,
        reason: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            description: description.into(),
            code: code.into(),
            details: Map::new(),
            plugin_name: None,
        }
    }

    /// Attach one structured detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Caller-facing denial without internal details.
    pub fn denial(&self) -> PolicyDenial {
        PolicyDenial {
            code: self.code.clone(),
            reason: self.reason.clone(),
            plugin_name: self.plugin_name.clone(),
        }
    }
}

/// What a plugin returns from a hook call.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginResult {
    /// `false` asks the dispatcher to stop processing.
    pub continue_processing: bool,
    /// Replacement payload; must be the same variant as the input.
    pub modified_payload: Option<HookPayload>,
    /// Reported policy breach, if any.
    pub violation: Option<PluginViolation>,
    /// Metadata merged into the request's audit trail under the plugin's name.
    pub metadata: Map<String, Value>,
}

impl Default for PluginResult {
    fn default() -> Self {
        Self {
            continue_processing: true,
            modified_payload: None,
            violation: None,
            metadata: Map::new(),
        }
    }
}

impl PluginResult {
    /// Let the call through unchanged.
    pub fn allow() -> Self {
        Self::default()
    }

    /// Let the call through with a replacement payload.
    pub fn modify(payload: HookPayload) -> Self {
        Self {
            modified_payload: Some(payload),
            ..Self::default()
        }
    }

    /// Report a violation and ask to stop processing.
    pub fn deny(violation: PluginViolation) -> Self {
        Self {
            continue_processing: false,
            violation: Some(violation),
            ..Self::default()
        }
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Encode as the JSON object external plugins exchange.
    pub fn to_wire(&self) -> Result<Value, WardenError> {
        let modified_payload = match &self.modified_payload {
            Some(payload) => Some(payload.to_wire()?),
            None => None,
        };
        let wire = PluginResultWire {
            continue_processing: self.continue_processing,
            modified_payload,
            violation: self.violation.clone(),
            metadata: self.metadata.clone(),
        };
        Ok(serde_json::to_value(wire)?)
    }

    /// Decode a result object, reading `modified_payload` as the hook's variant.
    pub fn from_wire(hook: HookType, value: Value) -> Result<Self, WardenError> {
        let wire: PluginResultWire = serde_json::from_value(value)?;
        let modified_payload = match wire.modified_payload {
            Some(Value::Null) | None => None,
            Some(payload) => Some(HookPayload::from_wire(hook, payload)?),
        };
        Ok(Self {
            continue_processing: wire.continue_processing,
            modified_payload,
            violation: wire.violation,
            metadata: wire.metadata,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PluginResultWire {
    #[serde(default = "default_true")]
    continue_processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modified_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    violation: Option<PluginViolation>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_pre(name: &str) -> HookPayload {
        let mut args = Map::new();
        args.insert("text".to_string(), json!("hello"));
        HookPayload::ToolPreInvoke(ToolPreInvokePayload {
            name: name.to_string(),
            args,
            headers: None,
        })
    }

    #[test]
    fn test_hook_type_names_parse_back() {
        for hook in HookType::ALL {
            assert_eq!(hook.as_str().parse::<HookType>().unwrap(), hook);
        }
        assert_eq!(
            serde_json::to_value(HookType::HttpAuthCheckPermission).unwrap(),
            json!("http_auth_check_permission")
        );
    }

    #[test]
    fn test_unknown_hook_type_is_config_error() {
        let err = "tool_pre_execute".parse::<HookType>().unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
        assert!(err.to_string().contains("tool_pre_execute"));
    }

    #[test]
    fn test_target_kind_per_hook() {
        assert_eq!(HookType::ToolPostInvoke.target_kind(), Some(TargetKind::Tool));
        assert_eq!(HookType::PromptPreFetch.target_kind(), Some(TargetKind::Prompt));
        assert_eq!(
            HookType::ResourcePostFetch.target_kind(),
            Some(TargetKind::Resource)
        );
        assert_eq!(HookType::HttpPreRequest.target_kind(), None);
    }

    #[test]
    fn test_payload_reports_its_hook_and_target() {
        let payload = tool_pre("delete_all");
        assert_eq!(payload.hook_type(), HookType::ToolPreInvoke);
        assert_eq!(payload.target_name(), Some("delete_all"));

        let http = HookPayload::HttpPreRequest(HttpPreRequestPayload {
            path: "/tools".to_string(),
            method: "GET".to_string(),
            ..Default::default()
        });
        assert_eq!(http.target_name(), None);
    }

    #[test]
    fn test_wire_form_is_untagged_inner_object() {
        let wire = tool_pre("search").to_wire().unwrap();
        assert_eq!(wire, json!({"name": "search", "args": {"text": "hello"}}));
    }

    #[test]
    fn test_from_wire_uses_hook_to_pick_variant() {
        let decoded = HookPayload::from_wire(
            HookType::ToolPostInvoke,
            json!({"name": "search", "result": {"hits": 3}}),
        )
        .unwrap();
        assert_eq!(decoded.hook_type(), HookType::ToolPostInvoke);

        // A resource body is not a valid tool payload.
        let err = HookPayload::from_wire(HookType::ToolPreInvoke, json!({"uri": "file:///x"}))
            .unwrap_err();
        assert!(matches!(err, WardenError::Serialization(_)));
    }

    #[test]
    fn test_tagged_serde_form() {
        let value = serde_json::to_value(tool_pre("search")).unwrap();
        assert_eq!(value["hook"], "tool_pre_invoke");
        assert_eq!(value["payload"]["name"], "search");
    }

    #[test]
    fn test_result_defaults_to_continue() {
        let result = PluginResult::from_wire(HookType::ToolPreInvoke, json!({})).unwrap();
        assert!(result.continue_processing);
        assert!(result.modified_payload.is_none());
        assert!(result.violation.is_none());
    }

    #[test]
    fn test_result_wire_decodes_modified_payload_and_violation() {
        let result = PluginResult::from_wire(
            HookType::ToolPreInvoke,
            json!({
                "continue_processing": false,
                "modified_payload": {"name": "search", "args": {"q": "x"}},
                "violation": {"reason": "nope", "code": "BLOCKED"},
                "metadata": {"checked": true}
            }),
        )
        .unwrap();
        assert!(!result.continue_processing);
        assert_eq!(
            result.modified_payload.unwrap().hook_type(),
            HookType::ToolPreInvoke
        );
        let violation = result.violation.unwrap();
        assert_eq!(violation.code, "BLOCKED");
        assert_eq!(violation.description, "");
        assert_eq!(result.metadata["checked"], json!(true));
    }

    #[test]
    fn test_result_to_wire_omits_empty_fields() {
        let wire = PluginResult::allow().to_wire().unwrap();
        assert_eq!(wire, json!({"continue_processing": true, "metadata": {}}));
    }

    #[test]
    fn test_violation_denial_drops_details() {
        let mut violation = PluginViolation::new("PII", "PII detected", "ssn in args")
            .with_detail("field", json!("args.ssn"));
        violation.plugin_name = Some("pii".to_string());
        let denial = violation.denial();
        assert_eq!(denial.code, "PII");
        assert_eq!(denial.reason, "PII detected");
        assert_eq!(denial.plugin_name.as_deref(), Some("pii"));
    }
}
