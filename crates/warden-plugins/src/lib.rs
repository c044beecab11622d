/// Plugin subsystem for the warden plugin engine.
///
/// - **Matcher**: decides which plugins apply to a hook call
/// - **Registry**: plugin factory, instantiation and per-hook priority bands
/// - **External**: proxy, transport and health tracking for remote plugins
pub mod external;
pub mod matcher;
pub mod registry;

pub use matcher::{matches, resolve_scope, MatchIdentity};
pub use registry::{ExecutionBand, PluginFactory, PluginRegistry, PluginSummary, RegisteredPlugin};
