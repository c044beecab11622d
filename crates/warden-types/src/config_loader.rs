/// Plugin configuration loader with environment templating and validation.
///
/// Reads the main YAML document, substitutes `{{ env.NAME }}` references,
/// appends plugin entries found in `plugin_dirs`, and validates the result.
/// Any failure is a [`WardenError::Config`]; the engine must not start with
/// an invalid configuration.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};

use crate::config::*;
use crate::errors::WardenError;

const ENV_REFERENCE: &str = r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

/// Loads and validates plugin configuration.
///
/// Expected layout:
/// ```text
/// config/
/// ├── plugins.yaml
/// └── plugins.d/
///     ├── 10-pii.yaml
///     └── 20-audit.yaml
/// ```
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load, render, and validate the configuration at `path`.
    ///
    /// Relative `plugin_dirs` resolve against the directory holding `path`.
    pub fn load(path: &Path) -> Result<WardenConfig, WardenError> {
        let content = read_file(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_yaml_str(&content, base_dir).map_err(|e| match e {
            WardenError::Config(msg) => WardenError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })?;
        tracing::info!(
            path = %path.display(),
            plugins = config.plugins.len(),
            "plugin configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a string, rendering against the process
    /// environment.
    pub fn from_yaml_str(content: &str, base_dir: &Path) -> Result<WardenConfig, WardenError> {
        Self::from_yaml_str_with(content, base_dir, |name| std::env::var(name).ok())
    }

    /// Parse configuration from a string with a custom variable lookup.
    pub fn from_yaml_str_with<F>(
        content: &str,
        base_dir: &Path,
        lookup: F,
    ) -> Result<WardenConfig, WardenError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rendered = render_env(content, &lookup)?;
        let mut config: WardenConfig = serde_yaml::from_str(&rendered)
            .map_err(|e| WardenError::Config(format!("failed to parse config: {e}")))?;
        Self::load_plugin_dirs(&mut config, base_dir, &lookup)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Append one plugin entry per `*.yaml` file in each `plugin_dirs` entry.
    ///
    /// Files are read in file-name order so registration order is stable.
    fn load_plugin_dirs<F>(
        config: &mut WardenConfig,
        base_dir: &Path,
        lookup: &F,
    ) -> Result<(), WardenError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for dir in config.plugin_dirs.clone() {
            let dir_path = resolve(base_dir, &dir);
            let entries = std::fs::read_dir(&dir_path).map_err(|e| {
                WardenError::Config(format!("failed to read {}: {e}", dir_path.display()))
            })?;

            let mut files = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| {
                    WardenError::Config(format!("failed to read directory entry: {e}"))
                })?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                    files.push(path);
                }
            }
            files.sort();

            for path in files {
                let content = render_env(&read_file(&path)?, lookup)?;
                let plugin: PluginConfig = serde_yaml::from_str(&content).map_err(|e| {
                    WardenError::Config(format!("failed to parse {}: {e}", path.display()))
                })?;
                tracing::debug!(
                    plugin = %plugin.name,
                    path = %path.display(),
                    "loaded plugin entry from plugin dir"
                );
                config.plugins.push(plugin);
            }
        }
        Ok(())
    }

    /// Validate the aggregate config for internal consistency.
    ///
    /// Checks:
    /// - Plugin names are non-empty and unique
    /// - Each in-process plugin lists at least one hook and a priority
    /// - Hooks are not duplicated
    /// - Timeouts are positive and finite
    /// - `mcp` is present iff `kind == external`, with an http(s) URL
    /// - A TLS `keyfile` comes with a `certfile`
    /// - The failure threshold is positive
    pub fn validate(config: &WardenConfig) -> Result<(), WardenError> {
        Self::validate_settings(&config.plugin_settings)?;

        let mut names: HashSet<&str> = HashSet::new();
        for plugin in &config.plugins {
            Self::validate_plugin(plugin)?;
            if !names.insert(plugin.name.as_str()) {
                return Err(WardenError::Config(format!(
                    "duplicate plugin name '{}'",
                    plugin.name
                )));
            }
        }
        Ok(())
    }

    /// Validate an external entry once its server's settings are merged in.
    ///
    /// Hooks and priority may come from either side but must now be present.
    pub fn validate_resolved(plugin: &PluginConfig) -> Result<(), WardenError> {
        Self::validate_plugin(plugin)?;
        let name = &plugin.name;
        if plugin.hooks.is_empty() {
            return Err(WardenError::Config(format!(
                "plugin '{name}': no hooks configured locally or by the plugin server"
            )));
        }
        if plugin.priority.is_none() {
            return Err(WardenError::Config(format!(
                "plugin '{name}': no priority configured locally or by the plugin server"
            )));
        }
        Ok(())
    }

    fn validate_settings(settings: &PluginSettings) -> Result<(), WardenError> {
        validate_timeout(settings.plugin_timeout, "plugin_settings.plugin_timeout")?;
        if settings.health_failure_threshold == 0 {
            return Err(WardenError::Config(
                "plugin_settings.health_failure_threshold must be positive (got 0)".to_string(),
            ));
        }
        let cooldown = settings.health_retry_cooldown;
        if !cooldown.is_finite() || cooldown < 0.0 {
            return Err(WardenError::Config(format!(
                "plugin_settings.health_retry_cooldown must be a non-negative number of seconds (got {cooldown})"
            )));
        }
        Ok(())
    }

    fn validate_plugin(plugin: &PluginConfig) -> Result<(), WardenError> {
        if plugin.name.trim().is_empty() {
            return Err(WardenError::Config(
                "plugin name must not be empty".to_string(),
            ));
        }
        let name = &plugin.name;

        if plugin.kind.trim().is_empty() {
            return Err(WardenError::Config(format!(
                "plugin '{name}': kind must not be empty"
            )));
        }

        // External entries may take hooks and priority from their server.
        if !plugin.is_external() {
            if plugin.hooks.is_empty() {
                return Err(WardenError::Config(format!(
                    "plugin '{name}': at least one hook is required"
                )));
            }
            if plugin.priority.is_none() {
                return Err(WardenError::Config(format!(
                    "plugin '{name}': priority is required"
                )));
            }
        }
        let mut hooks = HashSet::new();
        for hook in &plugin.hooks {
            if !hooks.insert(hook) {
                return Err(WardenError::Config(format!(
                    "plugin '{name}': duplicate hook '{hook}'"
                )));
            }
        }

        if let Some(timeout) = plugin.timeout {
            validate_timeout(timeout, &format!("plugin '{name}': timeout"))?;
        }

        match (plugin.is_external(), &plugin.mcp) {
            (true, None) => {
                return Err(WardenError::Config(format!(
                    "plugin '{name}': kind 'external' requires an 'mcp' section"
                )));
            }
            (false, Some(_)) => {
                return Err(WardenError::Config(format!(
                    "plugin '{name}': 'mcp' section is only valid for kind 'external'"
                )));
            }
            (true, Some(mcp)) => {
                if !(mcp.url.starts_with("http://") || mcp.url.starts_with("https://")) {
                    return Err(WardenError::Config(format!(
                        "plugin '{name}': invalid mcp url '{}' (expected http:// or https://)",
                        mcp.url
                    )));
                }
                if let Some(tls) = &mcp.tls {
                    if tls.keyfile.is_some() && tls.certfile.is_none() {
                        return Err(WardenError::Config(format!(
                            "plugin '{name}': mcp.tls.keyfile requires mcp.tls.certfile"
                        )));
                    }
                }
            }
            (false, None) => {}
        }
        Ok(())
    }
}

/// Substitute `{{ env.NAME }}` references. Unset variables are an error.
fn render_env<F>(content: &str, lookup: &F) -> Result<String, WardenError>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = Regex::new(ENV_REFERENCE)
        .map_err(|e| WardenError::Internal(format!("invalid env reference pattern: {e}")))?;

    let mut missing: Vec<String> = Vec::new();
    let rendered = pattern.replace_all(content, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(WardenError::Config(format!(
            "unset environment variable(s) referenced in config: {}",
            missing.join(", ")
        )));
    }
    Ok(rendered.into_owned())
}

fn validate_timeout(value: f64, context: &str) -> Result<(), WardenError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(WardenError::Config(format!(
            "{context} must be a positive number of seconds (got {value})"
        )));
    }
    Ok(())
}

fn resolve(base_dir: &Path, dir: &str) -> PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn read_file(path: &Path) -> Result<String, WardenError> {
    std::fs::read_to_string(path)
        .map_err(|e| WardenError::Config(format!("failed to read {}: {e}", path.display())))
}
