//! Streamable HTTP transport for external plugin servers.
//!
//! - HTTP POST for each JSON-RPC request
//! - Responses as `application/json` or a `text/event-stream` body
//! - Lazy `initialize` handshake followed by `notifications/initialized`
//! - Session management via the `Mcp-Session-Id` header
//! - Optional custom CA bundle and client certificate (mTLS)

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use warden_types::config::ExternalTlsConfig;
use warden_types::errors::WardenError;
use warden_types::wire::{
    JsonRpcMessage, MCP_PROTOCOL_VERSION, METHOD_INITIALIZE, NOTIFICATION_INITIALIZED,
};

const SESSION_HEADER: &str = "mcp-session-id";

// ============================================================
// Configuration
// ============================================================

/// Configuration for one external plugin endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Full endpoint URL (e.g. `http://localhost:8000/mcp`).
    pub endpoint: String,
    /// Extra headers sent with every request (e.g. auth tokens).
    pub headers: BTreeMap<String, String>,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for a whole request/response exchange.
    pub request_timeout: Duration,
    /// TLS settings; `None` uses the built-in roots.
    pub tls: Option<ExternalTlsConfig>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            tls: None,
        }
    }
}

// ============================================================
// SSE Event Parser
// ============================================================

/// A parsed SSE event from a `text/event-stream` body.
#[derive(Debug, Clone, Default)]
struct SseEvent {
    event: Option<String>,
    /// Accumulated across multiple `data:` lines.
    data: String,
}

/// Split a raw SSE body into events separated by blank lines.
fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    let normalized = body.replace("\r\n", "\n");
    let mut events = Vec::new();
    for raw_event in normalized.split("\n\n") {
        let trimmed = raw_event.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut event = SseEvent::default();
        let mut has_data = false;

        for line in trimmed.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event.event = Some(value.to_string()),
                "data" => {
                    if has_data {
                        event.data.push('\n');
                    }
                    event.data.push_str(value);
                    has_data = true;
                }
                // `id`, `retry` and unknown fields are ignored.
                _ => {}
            }
        }

        if has_data {
            events.push(event);
        }
    }
    events
}

// ============================================================
// Transport State
// ============================================================

struct TransportState {
    /// Session id assigned by the server during `initialize`.
    session_id: Option<String>,
    initialized: bool,
}

// ============================================================
// McpHttpTransport
// ============================================================

/// JSON-RPC client for one external plugin server.
///
/// Safe to share between tasks: state is behind a mutex that is never held
/// across a network call, and handshakes are serialized by a separate lock.
pub struct McpHttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
    state: Mutex<TransportState>,
    handshake: Mutex<()>,
    next_id: AtomicU64,
}

impl McpHttpTransport {
    /// Build the client. Unreadable TLS files are a [`WardenError::Config`].
    pub fn new(config: HttpTransportConfig) -> Result<Self, WardenError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);
        if let Some(tls) = &config.tls {
            builder = apply_tls(builder, tls)?;
        }
        let client = builder
            .build()
            .map_err(|e| WardenError::PluginProtocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            state: Mutex::new(TransportState {
                session_id: None,
                initialized: false,
            }),
            handshake: Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Current session id, if the server assigned one.
    pub async fn session_id(&self) -> Option<String> {
        self.state.lock().await.session_id.clone()
    }

    /// Send a request and return its `result`, performing the handshake first
    /// if this is the first call on the session.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, WardenError> {
        self.ensure_initialized().await?;
        self.call(method, params).await
    }

    /// Terminate the session, if any. Errors are logged, not returned.
    pub async fn close(&self) {
        let session_id = {
            let mut state = self.state.lock().await;
            state.initialized = false;
            state.session_id.take()
        };
        let Some(session_id) = session_id else {
            return;
        };
        let mut headers = self.build_headers(None);
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            headers.insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        match self
            .client
            .delete(&self.config.endpoint)
            .headers(headers)
            .send()
            .await
        {
            Ok(_) => tracing::debug!(endpoint = %self.config.endpoint, "session closed"),
            Err(e) => tracing::debug!(
                endpoint = %self.config.endpoint,
                error = %e,
                "failed to close session"
            ),
        }
    }

    async fn ensure_initialized(&self) -> Result<(), WardenError> {
        if self.state.lock().await.initialized {
            return Ok(());
        }
        let _guard = self.handshake.lock().await;
        if self.state.lock().await.initialized {
            return Ok(());
        }

        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "warden",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.call(METHOD_INITIALIZE, params).await?;
        self.post(JsonRpcMessage::notification(NOTIFICATION_INITIALIZED), None)
            .await?;

        self.state.lock().await.initialized = true;
        tracing::info!(
            endpoint = %self.config.endpoint,
            server = ?result.get("serverInfo"),
            "external plugin session initialized"
        );
        Ok(())
    }

    /// One request/response exchange without the handshake check.
    async fn call(&self, method: &str, params: Value) -> Result<Value, WardenError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = JsonRpcMessage::request(id, method, params);
        let response = self.post(message, Some(id)).await?.ok_or_else(|| {
            WardenError::PluginProtocol(format!("no response to '{method}' (id {id})"))
        })?;

        if let Some(error) = response.error {
            return Err(WardenError::PluginProtocol(format!(
                "'{method}' failed with JSON-RPC error {}: {}",
                error.code, error.message
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// POST one message and return the response matching `expect_id`.
    async fn post(
        &self,
        message: JsonRpcMessage,
        expect_id: Option<u64>,
    ) -> Result<Option<JsonRpcMessage>, WardenError> {
        let session_id = self.state.lock().await.session_id.clone();
        let headers = self.build_headers(session_id.as_deref());
        let body = serde_json::to_string(&message)?;

        tracing::debug!(
            endpoint = %self.config.endpoint,
            method = ?message.method,
            id = ?message.id,
            "sending JSON-RPC message"
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WardenError::PluginTimeout(format!("HTTP request timed out: {e}"))
                } else if e.is_connect() {
                    WardenError::PluginProtocol(format!(
                        "failed to connect to plugin server: {e}"
                    ))
                } else {
                    WardenError::PluginProtocol(format!("HTTP request failed: {e}"))
                }
            })?;

        self.capture_session_id(response.headers()).await;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && session_id.is_some() {
            // The server dropped our session; the next call starts a new one.
            let mut state = self.state.lock().await;
            state.session_id = None;
            state.initialized = false;
            return Err(WardenError::PluginProtocol(
                "plugin server session expired".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(Self::classify_http_error(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let response_body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                WardenError::PluginTimeout(format!("timed out reading response body: {e}"))
            } else {
                WardenError::PluginProtocol(format!("failed to read response body: {e}"))
            }
        })?;

        let Some(id) = expect_id else {
            return Ok(None);
        };
        if response_body.trim().is_empty() {
            return Ok(None);
        }

        let messages = if content_type.contains("text/event-stream") {
            Self::messages_from_sse(&response_body)
        } else {
            vec![serde_json::from_str::<JsonRpcMessage>(&response_body).map_err(|e| {
                WardenError::PluginProtocol(format!("invalid JSON-RPC response: {e}"))
            })?]
        };

        Ok(messages.into_iter().find(|msg| msg.is_response_to(id)))
    }

    fn messages_from_sse(body: &str) -> Vec<JsonRpcMessage> {
        let mut messages = Vec::new();
        for event in parse_sse_events(body) {
            // Default SSE event type is "message".
            let is_message = event.event.as_deref().is_none_or(|e| e == "message");
            if !is_message || event.data.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!(
                    data = event.data,
                    error = %e,
                    "failed to parse SSE event data as JSON-RPC message"
                ),
            }
        }
        messages
    }

    fn build_headers(&self, session_id: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        for (key, value) in &self.config.headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(val)) => {
                    headers.insert(name, val);
                }
                _ => tracing::warn!(header = %key, "skipping invalid configured header"),
            }
        }

        if let Some(session_id) = session_id {
            if let Ok(val) = HeaderValue::from_str(session_id) {
                headers.insert(HeaderName::from_static(SESSION_HEADER), val);
            }
        }
        headers
    }

    async fn capture_session_id(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut state = self.state.lock().await;
            if state.session_id.as_deref() != Some(value) {
                tracing::debug!(session_id = value, "captured plugin session ID");
                state.session_id = Some(value.to_string());
            }
        }
    }

    fn classify_http_error(status: reqwest::StatusCode) -> WardenError {
        if status.is_client_error() {
            WardenError::PluginProtocol(format!(
                "HTTP error {status}: plugin server rejected the request"
            ))
        } else if status.is_server_error() {
            WardenError::PluginProtocol(format!(
                "HTTP error {status}: plugin server encountered an error"
            ))
        } else {
            WardenError::PluginProtocol(format!("unexpected HTTP status {status}"))
        }
    }
}

// ============================================================
// TLS
// ============================================================

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &ExternalTlsConfig,
) -> Result<reqwest::ClientBuilder, WardenError> {
    if let Some(path) = &tls.ca_bundle {
        let pem = read_pem(path, "ca_bundle")?;
        let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            WardenError::Config(format!("invalid tls.ca_bundle {}: {e}", path.display()))
        })?;
        builder = builder.add_root_certificate(certificate);
    }

    if let Some(certfile) = &tls.certfile {
        let mut pem = read_pem(certfile, "certfile")?;
        // rustls wants the key and the chain in one PEM buffer.
        if let Some(keyfile) = &tls.keyfile {
            pem.push(b'\n');
            pem.extend(read_pem(keyfile, "keyfile")?);
        }
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
            WardenError::Config(format!(
                "invalid client certificate {}: {e}",
                certfile.display()
            ))
        })?;
        builder = builder.identity(identity);
    }

    if !tls.verify {
        tracing::warn!("server certificate verification disabled for external plugin");
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder)
}

fn read_pem(path: &Path, field: &str) -> Result<Vec<u8>, WardenError> {
    std::fs::read(path).map_err(|e| {
        WardenError::Config(format!("failed to read tls.{field} {}: {e}", path.display()))
    })
}

// ============================================================
// Tests
// ============================================================
