//! JSON-RPC 2.0 envelope used to talk to external plugin servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision sent during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Method used to invoke a hook on an external plugin server.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Liveness probe method.
pub const METHOD_PING: &str = "ping";
/// Session handshake method.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Notification sent once `initialize` succeeds.
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";

/// Argument keys of a hook `tools/call`.
pub const ARG_PLUGIN_NAME: &str = "plugin_name";
pub const ARG_PAYLOAD: &str = "payload";
pub const ARG_CONTEXT: &str = "context";

/// Tool returning the server's own entry for one plugin, called with
/// `{"name": <plugin name>}`.
pub const TOOL_GET_PLUGIN_CONFIG: &str = "get_plugin_config";
pub const ARG_NAME: &str = "name";

/// Keys of the JSON object an external plugin returns.
pub const REPLY_RESULT: &str = "result";
pub const REPLY_ERROR: &str = "error";
pub const REPLY_CONTEXT: &str = "context";

/// A JSON-RPC 2.0 request, response, or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Build a request carrying a numeric id.
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification (no id, no response expected).
    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params: None,
            result: None,
            error: None,
        }
    }

    /// Whether this message answers the request with `id`.
    pub fn is_response_to(&self, id: u64) -> bool {
        self.method.is_none() && self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
