/// Configuration types for the warden plugin engine.
///
/// Parsed from a single YAML document (see [`crate::config_loader`]) and
/// immutable once the registry is built.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::WardenError;
use crate::hooks::HookType;

/// `kind` value marking a plugin served by an external process.
pub const EXTERNAL_KIND: &str = "external";

/// Top-level configuration document.
///
/// ```yaml
/// plugins:
///   - name: DenyList
///     kind: plugins.deny.DenyListPlugin
///     hooks: [tool_pre_invoke]
///     mode: enforce
///     priority: 10
/// plugin_settings:
///   plugin_timeout: 30
/// plugin_dirs: [plugins.d]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub plugin_settings: PluginSettings,
    /// Extra directories scanned for one-plugin-per-file YAML entries.
    #[serde(default)]
    pub plugin_dirs: Vec<String>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Default per-plugin deadline in seconds.
    pub plugin_timeout: f64,
    /// Whether plugin failures block requests for `enforce` plugins.
    pub fail_on_plugin_error: bool,
    /// Seconds between external health probes; 0 disables probing.
    pub plugin_health_check_interval: u64,
    /// Consecutive failures before an external plugin is marked unhealthy.
    pub health_failure_threshold: u32,
    /// Seconds an unhealthy external plugin waits before a trial call when
    /// probing is disabled.
    pub health_retry_cooldown: f64,
    /// Run plugins of one band concurrently.
    pub parallel_execution_within_band: bool,
    /// Expose the plugin listing API.
    pub enable_plugin_api: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            plugin_timeout: 30.0,
            fail_on_plugin_error: false,
            plugin_health_check_interval: 60,
            health_failure_threshold: 3,
            health_retry_cooldown: 30.0,
            parallel_execution_within_band: true,
            enable_plugin_api: false,
        }
    }
}

impl PluginSettings {
    /// Probe interval, or `None` when probing is disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        match self.plugin_health_check_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Cooldown before a trial call to an unhealthy plugin, used only when
    /// probing is disabled.
    pub fn retry_cooldown(&self) -> Option<Duration> {
        if self.health_check_interval().is_some() {
            return None;
        }
        // Negative or non-finite values never pass validation.
        Some(Duration::try_from_secs_f64(self.health_retry_cooldown).unwrap_or(Duration::ZERO))
    }
}

/// How the dispatcher treats a plugin's violations and failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMode {
    /// Violations block; failures block only with `fail_on_plugin_error`.
    #[default]
    Enforce,
    /// Violations and failures are logged; never blocks.
    Permissive,
    /// Never called.
    Disabled,
    /// Violations block; failures are ignored.
    EnforceIgnoreError,
}

impl PluginMode {
    /// Whether a violation from a plugin in this mode blocks the request.
    pub fn blocks_on_violation(&self) -> bool {
        matches!(self, PluginMode::Enforce | PluginMode::EnforceIgnoreError)
    }
}

/// One plugin entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Dotted in-process type id, or `"external"`.
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Required for in-process plugins; an external entry may leave it to
    /// its server.
    #[serde(default)]
    pub hooks: Vec<HookType>,
    #[serde(default)]
    pub mode: PluginMode,
    /// Lower runs earlier. Equal priorities form one band. Same rule as
    /// `hooks` when absent.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Per-plugin deadline override in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Any matching rule selects the plugin; empty matches everything.
    #[serde(default)]
    pub conditions: Vec<MatchRule>,
    #[serde(default)]
    pub applied_to: Option<AppliedTo>,
    /// Opaque settings handed to the plugin's constructor.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Endpoint of an external plugin; required iff `kind == "external"`.
    #[serde(default)]
    pub mcp: Option<ExternalEndpointConfig>,
}

impl PluginConfig {
    pub fn is_external(&self) -> bool {
        self.kind == EXTERNAL_KIND
    }

    /// Resolve where this plugin's code lives.
    pub fn source(&self) -> Result<PluginSource, WardenError> {
        if !self.is_external() {
            return Ok(PluginSource::InProcess {
                type_id: self.kind.clone(),
            });
        }
        let mcp = self.mcp.as_ref().ok_or_else(|| {
            WardenError::Config(format!(
                "plugin '{}': kind 'external' requires an 'mcp' section",
                self.name
            ))
        })?;
        Ok(PluginSource::External {
            endpoint: mcp.url.clone(),
            protocol: mcp.proto,
            headers: mcp.headers.clone(),
            tls: mcp.tls.clone(),
        })
    }

    /// Fill the fields this entry leaves unset from the plugin server's own
    /// entry. Anything set locally wins; `mode` and `timeout` always stay local.
    pub fn fill_from_remote(&mut self, remote: RemotePluginConfig) {
        if self.description.is_none() {
            self.description = remote.description;
        }
        if self.hooks.is_empty() {
            self.hooks = remote.hooks;
        }
        if self.priority.is_none() {
            self.priority = remote.priority;
        }
        if self.tags.is_empty() {
            self.tags = remote.tags;
        }
        if self.conditions.is_empty() {
            self.conditions = remote.conditions;
        }
        if self.applied_to.is_none() {
            self.applied_to = remote.applied_to;
        }
        if self.config.is_empty() {
            self.config = remote.config;
        }
    }

    /// Effective deadline for one call of this plugin.
    pub fn timeout(&self, settings: &PluginSettings) -> Duration {
        let secs = self.timeout.unwrap_or(settings.plugin_timeout);
        // Non-finite or negative values never pass validation.
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(30))
    }
}

/// Where a plugin's implementation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    InProcess {
        type_id: String,
    },
    External {
        endpoint: String,
        protocol: ExternalProtocol,
        headers: BTreeMap<String, String>,
        tls: Option<ExternalTlsConfig>,
    },
}

/// A plugin's entry as reported by its external server. Unknown fields are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemotePluginConfig {
    pub description: Option<String>,
    pub hooks: Vec<HookType>,
    pub priority: Option<i32>,
    pub tags: Vec<String>,
    pub conditions: Vec<MatchRule>,
    pub applied_to: Option<AppliedTo>,
    pub config: Map<String, Value>,
}

/// `mcp:` section of an external plugin entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEndpointConfig {
    #[serde(default)]
    pub proto: ExternalProtocol,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub tls: Option<ExternalTlsConfig>,
}

/// `mcp.tls` section: server verification and optional client certificate.
///
/// ```yaml
/// tls:
///   ca_bundle: /etc/warden/ca.pem
///   certfile: /etc/warden/client.pem
///   keyfile: /etc/warden/client.key
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalTlsConfig {
    /// PEM file with the CA certificates trusted for the plugin server.
    pub ca_bundle: Option<PathBuf>,
    /// PEM client certificate for mutual TLS.
    pub certfile: Option<PathBuf>,
    /// PEM private key for `certfile`; may be omitted if `certfile` holds it.
    pub keyfile: Option<PathBuf>,
    /// Verify the server certificate.
    pub verify: bool,
}

impl Default for ExternalTlsConfig {
    fn default() -> Self {
        Self {
            ca_bundle: None,
            certfile: None,
            keyfile: None,
            verify: true,
        }
    }
}

/// Transport used to reach an external plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalProtocol {
    #[default]
    #[serde(rename = "streamablehttp", alias = "STREAMABLEHTTP", alias = "streamable_http")]
    StreamableHttp,
}

/// One condition rule. Non-empty fields are AND'd; values within a field OR'd.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchRule {
    pub server_ids: Vec<String>,
    pub tenant_ids: Vec<String>,
    pub tools: Vec<String>,
    pub prompts: Vec<String>,
    pub resources: Vec<String>,
    /// Substrings matched against the requesting user.
    pub user_patterns: Vec<String>,
    /// Settings forwarded to the plugin when this rule matches.
    pub extensions: Map<String, Value>,
}

/// Narrows a plugin to listed targets per category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppliedTo {
    pub tools: Vec<TargetBinding>,
    pub prompts: Vec<TargetBinding>,
    pub resources: Vec<TargetBinding>,
}

/// A named target with per-target settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetBinding {
    #[serde(
        alias = "tool_name",
        alias = "prompt_name",
        alias = "resource_uri",
        alias = "uri"
    )]
    pub name: String,
    /// Payload paths the plugin should inspect for this target.
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub extensions: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings: PluginSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.plugin_timeout, 30.0);
        assert!(!settings.fail_on_plugin_error);
        assert_eq!(settings.health_failure_threshold, 3);
        assert!(settings.parallel_execution_within_band);
        assert_eq!(
            settings.health_check_interval(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(settings.retry_cooldown(), None);
    }

    #[test]
    fn test_zero_interval_disables_probing() {
        let settings = PluginSettings {
            plugin_health_check_interval: 0,
            ..Default::default()
        };
        assert_eq!(settings.health_check_interval(), None);
        assert_eq!(settings.retry_cooldown(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_plugin_entry_parses_with_aliases() {
        let plugin: PluginConfig = serde_yaml::from_str(
            r#"
name: Pii
kind: external
hooks: [tool_pre_invoke]
mode: enforce_ignore_error
priority: 5
applied_to:
  tools:
    - tool_name: send_email
      context: [args.body]
mcp:
  proto: STREAMABLEHTTP
  url: http://localhost:8000/mcp
"#,
        )
        .unwrap();
        assert_eq!(plugin.mode, PluginMode::EnforceIgnoreError);
        assert_eq!(
            plugin.applied_to.as_ref().unwrap().tools[0].name,
            "send_email"
        );
        match plugin.source().unwrap() {
            PluginSource::External {
                endpoint, protocol, ..
            } => {
                assert_eq!(endpoint, "http://localhost:8000/mcp");
                assert_eq!(protocol, ExternalProtocol::StreamableHttp);
            }
            other => panic!("expected external source, got {other:?}"),
        }
    }

    #[test]
    fn test_tls_section_defaults_to_verify() {
        let plugin: PluginConfig = serde_yaml::from_str(
            r#"
name: Pii
kind: external
mcp:
  url: https://plugins.internal/mcp
  tls: {ca_bundle: /etc/warden/ca.pem}
"#,
        )
        .unwrap();
        assert!(plugin.hooks.is_empty());
        assert_eq!(plugin.priority, None);
        match plugin.source().unwrap() {
            PluginSource::External { tls: Some(tls), .. } => {
                assert!(tls.verify);
                assert_eq!(tls.ca_bundle, Some(PathBuf::from("/etc/warden/ca.pem")));
                assert_eq!(tls.certfile, None);
            }
            other => panic!("expected external source with tls, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_entry_fills_only_unset_fields() {
        let mut plugin: PluginConfig = serde_yaml::from_str(
            r#"
name: Pii
kind: external
priority: 3
mode: permissive
mcp: {url: "http://localhost:8000/mcp"}
"#,
        )
        .unwrap();
        let remote: RemotePluginConfig = serde_json::from_value(serde_json::json!({
            "name": "Pii",
            "kind": "plugins.pii.PiiFilter",
            "hooks": ["tool_pre_invoke", "tool_post_invoke"],
            "priority": 50,
            "mode": "enforce",
            "tags": ["pii"],
            "config": {"mask": "*"}
        }))
        .unwrap();

        plugin.fill_from_remote(remote);
        assert_eq!(
            plugin.hooks,
            vec![HookType::ToolPreInvoke, HookType::ToolPostInvoke]
        );
        assert_eq!(plugin.priority, Some(3));
        assert_eq!(plugin.mode, PluginMode::Permissive);
        assert_eq!(plugin.tags, vec!["pii".to_string()]);
        assert_eq!(plugin.config["mask"], "*");
    }

    #[test]
    fn test_external_without_mcp_section_is_config_error() {
        let plugin: PluginConfig = serde_yaml::from_str(
            "{name: x, kind: external, hooks: [tool_pre_invoke], priority: 1}",
        )
        .unwrap();
        assert!(matches!(plugin.source(), Err(WardenError::Config(_))));
    }

    #[test]
    fn test_timeout_override() {
        let settings = PluginSettings::default();
        let mut plugin: PluginConfig = serde_yaml::from_str(
            "{name: x, kind: a.B, hooks: [tool_pre_invoke], priority: 1}",
        )
        .unwrap();
        assert_eq!(plugin.timeout(&settings), Duration::from_secs(30));
        plugin.timeout = Some(0.5);
        assert_eq!(plugin.timeout(&settings), Duration::from_millis(500));
    }

    #[test]
    fn test_blocking_modes() {
        assert!(PluginMode::Enforce.blocks_on_violation());
        assert!(PluginMode::EnforceIgnoreError.blocks_on_violation());
        assert!(!PluginMode::Permissive.blocks_on_violation());
        assert!(!PluginMode::Disabled.blocks_on_violation());
    }
}
