//! Plugin registry: instantiates configured plugins and orders them into
//! per-hook execution bands.
//!
//! Built once at startup from a validated [`WardenConfig`]. In-process plugins
//! are created through a [`PluginFactory`] keyed by the dotted `kind` type id;
//! `kind: external` entries get an [`ExternalPluginProxy`], and fields the
//! entry leaves unset are filled from the plugin server's own entry. Any
//! failure is a fatal [`WardenError::Config`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warden_types::config::{PluginConfig, PluginMode, PluginSettings, PluginSource, WardenConfig};
use warden_types::config_loader::ConfigLoader;
use warden_types::errors::WardenError;
use warden_types::hooks::HookType;
use warden_types::outcome::HealthState;
use warden_types::traits::Plugin;

use crate::external::{ExternalPluginProxy, HealthTracker, HttpTransportConfig, McpHttpTransport};

/// Constructor for one in-process plugin type.
pub type PluginConstructor =
    dyn Fn(&PluginConfig) -> Result<Arc<dyn Plugin>, WardenError> + Send + Sync;

// ============================================================
// Plugin Factory
// ============================================================

/// Maps in-process type ids (the `kind` field) to constructors.
#[derive(Clone, Default)]
pub struct PluginFactory {
    constructors: HashMap<String, Arc<PluginConstructor>>,
}

impl PluginFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `type_id`, replacing any previous one.
    pub fn register<F>(&mut self, type_id: impl Into<String>, constructor: F)
    where
        F: Fn(&PluginConfig) -> Result<Arc<dyn Plugin>, WardenError> + Send + Sync + 'static,
    {
        self.constructors.insert(type_id.into(), Arc::new(constructor));
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.constructors.contains_key(type_id)
    }

    /// Instantiate the plugin described by `config`.
    pub fn create(&self, config: &PluginConfig) -> Result<Arc<dyn Plugin>, WardenError> {
        let constructor = self.constructors.get(&config.kind).ok_or_else(|| {
            WardenError::Config(format!(
                "plugin '{}': unknown plugin kind '{}'",
                config.name, config.kind
            ))
        })?;
        constructor(config).map_err(|e| {
            WardenError::Config(format!(
                "plugin '{}': failed to construct '{}': {e}",
                config.name, config.kind
            ))
        })
    }
}

// ============================================================
// Registered Plugins and Bands
// ============================================================

/// A configured plugin and, unless disabled, its live instance.
pub struct RegisteredPlugin {
    pub config: PluginConfig,
    /// `None` for disabled plugins, which are never instantiated.
    pub instance: Option<Arc<dyn Plugin>>,
    /// Position in the configuration; the stable intra-band order.
    pub index: usize,
}

impl RegisteredPlugin {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn mode(&self) -> PluginMode {
        self.config.mode
    }

    /// Always set once loaded; disabled external entries may lack one.
    pub fn priority(&self) -> i32 {
        self.config.priority.unwrap_or_default()
    }
}

/// Plugins sharing one priority for one hook, in registration order.
#[derive(Clone)]
pub struct ExecutionBand {
    pub priority: i32,
    pub members: Vec<Arc<RegisteredPlugin>>,
}

/// Row returned by the plugin listing API.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub hooks: Vec<HookType>,
    pub mode: PluginMode,
    pub priority: i32,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,
}

// ============================================================
// Plugin Registry
// ============================================================

/// Immutable plugin set plus the background probe loops of external plugins.
pub struct PluginRegistry {
    plugins: Vec<Arc<RegisteredPlugin>>,
    bands: HashMap<HookType, Vec<ExecutionBand>>,
    external: HashMap<String, Arc<ExternalPluginProxy>>,
    settings: PluginSettings,
    shutdown_tx: watch::Sender<bool>,
    probe_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginRegistry {
    /// Validate `config`, instantiate and initialize every enabled plugin,
    /// build the bands, and start health probes for external plugins.
    pub async fn load(config: WardenConfig, factory: &PluginFactory) -> Result<Self, WardenError> {
        ConfigLoader::validate(&config)?;
        let settings = config.plugin_settings;

        let mut plugins = Vec::with_capacity(config.plugins.len());
        let mut external = HashMap::new();

        for (index, mut plugin_config) in config.plugins.into_iter().enumerate() {
            let source = plugin_config.source()?;
            let disabled = plugin_config.mode == PluginMode::Disabled;

            let instance: Option<Arc<dyn Plugin>> = match source {
                PluginSource::InProcess { type_id } => {
                    if !factory.contains(&type_id) {
                        return Err(WardenError::Config(format!(
                            "plugin '{}': unknown plugin kind '{type_id}'",
                            plugin_config.name
                        )));
                    }
                    if disabled {
                        None
                    } else {
                        Some(factory.create(&plugin_config)?)
                    }
                }
                PluginSource::External {
                    endpoint,
                    headers,
                    tls,
                    ..
                } => {
                    reqwest::Url::parse(&endpoint).map_err(|e| {
                        WardenError::Config(format!(
                            "plugin '{}': invalid mcp url '{endpoint}': {e}",
                            plugin_config.name
                        ))
                    })?;
                    if disabled {
                        None
                    } else {
                        let timeout = plugin_config.timeout(&settings);
                        let transport = McpHttpTransport::new(HttpTransportConfig {
                            endpoint,
                            headers,
                            connect_timeout: timeout.min(Duration::from_secs(10)),
                            request_timeout: timeout,
                            tls,
                        })
                        .map_err(|e| {
                            WardenError::Config(format!("plugin '{}': {e}", plugin_config.name))
                        })?;
                        let mut health = HealthTracker::new(settings.health_failure_threshold);
                        if let Some(cooldown) = settings.retry_cooldown() {
                            health = health.with_retry_after(cooldown);
                        }
                        let proxy = Arc::new(ExternalPluginProxy::new(
                            plugin_config.name.clone(),
                            transport,
                            health,
                        ));
                        external.insert(plugin_config.name.clone(), proxy.clone());
                        Some(proxy as Arc<dyn Plugin>)
                    }
                }
            };

            if let Some(instance) = &instance {
                instance.initialize().await.map_err(|e| {
                    WardenError::Config(format!(
                        "plugin '{}' failed to initialize: {e}",
                        plugin_config.name
                    ))
                })?;
                if let Some(proxy) = external.get(&plugin_config.name) {
                    if let Some(remote) = proxy.remote_config() {
                        plugin_config.fill_from_remote(remote.clone());
                    }
                    ConfigLoader::validate_resolved(&plugin_config)?;
                }
                info!(
                    plugin = %plugin_config.name,
                    kind = %plugin_config.kind,
                    priority = plugin_config.priority.unwrap_or_default(),
                    mode = ?plugin_config.mode,
                    "plugin initialized"
                );
            } else {
                debug!(plugin = %plugin_config.name, "plugin disabled, not instantiated");
            }

            plugins.push(Arc::new(RegisteredPlugin {
                config: plugin_config,
                instance,
                index,
            }));
        }

        let bands = build_bands(&plugins);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut probe_tasks = Vec::new();
        if let Some(interval) = settings.health_check_interval() {
            for proxy in external.values() {
                probe_tasks.push(
                    proxy
                        .clone()
                        .spawn_health_checks(interval, shutdown_rx.clone()),
                );
            }
        }

        info!(
            plugins = plugins.len(),
            external = external.len(),
            hooks = bands.len(),
            "plugin registry loaded"
        );

        Ok(Self {
            plugins,
            bands,
            external,
            settings,
            shutdown_tx,
            probe_tasks: Mutex::new(probe_tasks),
        })
    }

    /// Bands for `hook`, in ascending priority order.
    pub fn bands_for(&self, hook: HookType) -> &[ExecutionBand] {
        self.bands.get(&hook).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All plugins in registration order.
    pub fn plugins(&self) -> &[Arc<RegisteredPlugin>] {
        &self.plugins
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredPlugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn external_proxy(&self, name: &str) -> Option<&Arc<ExternalPluginProxy>> {
        self.external.get(name)
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    /// Listing of every configured plugin; requires `enable_plugin_api`.
    pub fn plugin_summaries(&self) -> Result<Vec<PluginSummary>, WardenError> {
        if !self.settings.enable_plugin_api {
            return Err(WardenError::Forbidden(
                "plugin API is disabled (set plugin_settings.enable_plugin_api)".to_string(),
            ));
        }
        Ok(self
            .plugins
            .iter()
            .map(|plugin| PluginSummary {
                name: plugin.config.name.clone(),
                kind: plugin.config.kind.clone(),
                description: plugin.config.description.clone(),
                hooks: plugin.config.hooks.clone(),
                mode: plugin.config.mode,
                priority: plugin.priority(),
                tags: plugin.config.tags.clone(),
                health: plugin.instance.as_ref().and_then(|i| i.health()),
            })
            .collect())
    }

    /// Stop probe loops and shut down every plugin instance.
    ///
    /// Individual shutdown failures are logged, not returned.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.probe_tasks.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "health check task ended abnormally");
            }
        }

        for plugin in &self.plugins {
            let Some(instance) = &plugin.instance else {
                continue;
            };
            if let Err(e) = instance.shutdown().await {
                warn!(plugin = %plugin.name(), error = %e, "plugin shutdown failed");
            }
        }
        info!("plugin registry shut down");
    }
}

/// Group plugins per hook into priority bands, keeping registration order
/// within a band.
fn build_bands(plugins: &[Arc<RegisteredPlugin>]) -> HashMap<HookType, Vec<ExecutionBand>> {
    let mut bands: HashMap<HookType, Vec<ExecutionBand>> = HashMap::new();
    for hook in HookType::ALL {
        let mut members: Vec<&Arc<RegisteredPlugin>> = plugins
            .iter()
            .filter(|p| p.config.hooks.contains(&hook))
            .collect();
        if members.is_empty() {
            continue;
        }
        // Stable sort: equal priorities stay in registration order.
        members.sort_by_key(|p| p.priority());

        let mut hook_bands: Vec<ExecutionBand> = Vec::new();
        for plugin in members {
            match hook_bands.last_mut() {
                Some(band) if band.priority == plugin.priority() => {
                    band.members.push(plugin.clone())
                }
                _ => hook_bands.push(ExecutionBand {
                    priority: plugin.priority(),
                    members: vec![plugin.clone()],
                }),
            }
        }
        bands.insert(hook, hook_bands);
    }
    bands
}
