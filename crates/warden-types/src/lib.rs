/// Shared types, traits, and errors for the warden plugin engine.
///
/// This crate is the foundation the other warden crates depend on.
/// It contains:
/// - **Hook payloads and results** (`hooks`) exchanged with plugins
/// - **Request context** (`context`) threaded through every dispatch
/// - **Outcomes and audit records** (`outcome`) produced by the dispatcher
/// - **Config types and loader** (`config`, `config_loader`)
/// - **Trait contracts** (`traits`) for plugins and audit sinks
/// - **JSON-RPC wire types** (`wire`) for external plugin servers
/// - **Error types** (`errors`) for unified error handling
pub mod config;
pub mod config_loader;
pub mod context;
pub mod errors;
pub mod hooks;
pub mod outcome;
pub mod traits;
pub mod wire;

// Re-export commonly used types at the crate root for convenience.
pub use context::{CallIdentity, CallScope, PluginCallContext, PluginContext};
pub use errors::{PolicyDenial, WardenError};
pub use hooks::*;
pub use outcome::*;
pub use traits::*;
