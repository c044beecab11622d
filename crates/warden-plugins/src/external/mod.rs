//! Out-of-process plugins reached over MCP streamable HTTP.

pub mod health;
pub mod proxy;
pub mod transport_http;

pub use health::HealthTracker;
pub use proxy::ExternalPluginProxy;
pub use transport_http::{HttpTransportConfig, McpHttpTransport};
