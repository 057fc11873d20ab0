//! Application configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the application directory under the platform config/data roots.
pub const APP_DIR: &str = "bench";

/// Configuration for the application and its plugin subsystem.
///
/// Loaded from `bench.toml`; every field has a default so an empty or
/// missing file is valid.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Directory holding installed plugin bundles.
    #[builder(default = "default_plugin_dir()")]
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Application settings file (also stores per-bundle enabled flags).
    #[builder(default = "default_settings_path()")]
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Budget for a single plugin `start()` call, in milliseconds.
    #[builder(default = "5000")]
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Maximum memory per bundle VM in MB (0 = unlimited).
    #[builder(default = "64")]
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,

    /// Allow plugins to read files through the host API.
    #[builder(default = "false")]
    #[serde(default)]
    pub allow_fs_read: bool,

    /// Allow plugins to run external commands.
    #[builder(default = "false")]
    #[serde(default)]
    pub allow_exec: bool,

    /// Extra bundle file extensions mapped to a runtime name, written as a
    /// `[extension_aliases]` table (e.g. `plugin = "lua"`).
    #[builder(default = "default_extension_aliases()")]
    #[serde(default = "default_extension_aliases")]
    pub extension_aliases: BTreeMap<String, String>,
}

fn default_plugin_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("plugins")
}

fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.toml")
}

fn default_start_timeout_ms() -> u64 {
    5000
}

fn default_max_memory_mb() -> usize {
    64
}

fn default_extension_aliases() -> BTreeMap<String, String> {
    BTreeMap::from([("plugin".to_string(), "lua".to_string())])
}

/// Platform configuration directory for the application.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl AppConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(ref dir) = self.plugin_dir {
            if dir.as_os_str().is_empty() {
                return Err("Plugin directory cannot be empty".to_string());
            }
        }
        if let Some(0) = self.start_timeout_ms {
            return Err("Start timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl AppConfig {
    /// Create a new config builder.
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        default_config_dir().join("bench.toml")
    }

    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugin_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                message: "plugin_dir cannot be empty".into(),
            });
        }
        if self.start_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "start_timeout_ms must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Override the plugin directory.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    /// Override the settings file.
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = path.into();
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            settings_path: default_settings_path(),
            start_timeout_ms: default_start_timeout_ms(),
            max_memory_mb: default_max_memory_mb(),
            allow_fs_read: false,
            allow_exec: false,
            extension_aliases: default_extension_aliases(),
        }
    }
}
