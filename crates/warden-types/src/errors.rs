/// Unified error type for the warden plugin engine.
///
/// All crates use this error type for propagation across crate boundaries.
/// Plugin implementations return it from their hooks; the dispatcher
/// classifies the variant into a per-plugin outcome status.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Invalid or unloadable configuration. Fatal: the engine must not start.
    #[error("config error: {0}")]
    Config(String),

    /// A plugin call exceeded its deadline.
    #[error("plugin timeout: {0}")]
    PluginTimeout(String),

    /// An in-process plugin (or a remote plugin's own code) raised an error.
    #[error("plugin execution error: {0}")]
    PluginExecution(String),

    /// Transport or serialization failure talking to an external plugin.
    #[error("plugin protocol error: {0}")]
    PluginProtocol(String),

    /// The dispatcher stopped processing and denied the operation, either on
    /// a plugin's reported violation or on a blocking plugin failure.
    #[error("request blocked: {0}")]
    EngineShortCircuit(PolicyDenial),

    /// Failure writing an audit record.
    #[error("audit error: {0}")]
    Audit(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation not permitted by the current settings.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Caller-facing summary of a blocking decision.
///
/// Carries only the violation's code and reason so the gateway can build a
/// protocol-level error without leaking plugin diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDenial {
    /// Machine-readable violation code (e.g. `"BLOCKED"`, `"plugin_failure"`).
    pub code: String,
    /// Short human-readable reason.
    pub reason: String,
    /// Plugin that produced the violation, if known.
    pub plugin_name: Option<String>,
}

impl std::fmt::Display for PolicyDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.plugin_name {
            Some(plugin) => write!(f, "[{}] {} (plugin '{}')", self.code, self.reason, plugin),
            None => write!(f, "[{}] {}", self.code, self.reason),
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WardenError {
    fn from(err: serde_yaml::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}
