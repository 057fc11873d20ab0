//! Plugin system configuration.

use std::path::PathBuf;

use bench_core::AppConfig;
use indexmap::IndexMap;

use crate::sandbox::{Permission, SandboxConfig};

/// Settings-file key prefix for per-bundle enabled flags.
pub const FLAG_PREFIX: &str = "plugin.";

/// Global plugin system configuration.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Directory where bundles are stored.
    pub plugin_dir: PathBuf,

    /// Application settings file holding the enabled flags.
    pub settings_path: PathBuf,

    /// Extra bundle extensions mapped to a runtime name.
    pub extension_aliases: IndexMap<String, String>,

    /// Limits applied to every bundle VM.
    pub sandbox: SandboxConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl PluginConfig {
    /// Derive the plugin configuration from the application configuration.
    pub fn from_app_config(app: &AppConfig) -> Self {
        let mut sandbox = SandboxConfig::default()
            .with_timeout(app.start_timeout_ms)
            .with_memory_limit(app.max_memory_mb.saturating_mul(1024 * 1024));
        if app.allow_fs_read {
            sandbox = sandbox.grant(Permission::Read);
        }
        if app.allow_exec {
            sandbox = sandbox.grant(Permission::Execute);
        }

        Self {
            plugin_dir: app.plugin_dir.clone(),
            settings_path: app.settings_path.clone(),
            extension_aliases: app
                .extension_aliases
                .iter()
                .map(|(ext, runtime)| (normalize_extension(ext), runtime.clone()))
                .collect(),
            sandbox,
        }
    }

    /// Create a new config with a custom plugin directory.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    /// Use a different settings file.
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = path.into();
        self
    }

    /// Set the start timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.sandbox.timeout_ms = timeout_ms;
        self
    }

    /// Replace the sandbox.
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Map an extra extension onto a runtime.
    pub fn with_alias(mut self, extension: &str, runtime: impl Into<String>) -> Self {
        self.extension_aliases
            .insert(normalize_extension(extension), runtime.into());
        self
    }
}

/// Strip a leading dot and lowercase an extension.
pub(crate) fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}
