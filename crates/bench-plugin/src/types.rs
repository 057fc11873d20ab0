//! Core types for the plugin system.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// A bundle could not be opened, evaluated or instantiated.
///
/// Recoverable: the bundle stays installed and other bundles are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Failed to load bundle '{bundle_id}': {cause}")]
pub struct LoadError {
    /// Bundle that failed.
    pub bundle_id: String,
    /// Human-readable cause.
    pub cause: String,
}

impl LoadError {
    /// Create a new load error.
    pub fn new(bundle_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            cause: cause.into(),
        }
    }
}

/// Errors that can occur in the plugin system.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Bundle failed to load.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Install could not complete atomically. Safe to retry.
    #[error("Could not install bundle '{id}': {message}")]
    Conflict { id: String, message: String },

    /// Operation referenced an unknown bundle id.
    #[error("Bundle not found: {id}")]
    NotFound { id: String },

    /// A `start()` call exceeded its budget.
    #[error("Plugin '{name}' from bundle '{bundle_id}' did not start within {timeout_ms}ms")]
    StartTimeout {
        name: String,
        bundle_id: String,
        timeout_ms: u64,
    },

    /// The file offered for install is not a usable bundle.
    #[error("Invalid bundle {path}: {message}")]
    InvalidBundle { path: PathBuf, message: String },

    /// Plugin code raised an error.
    #[error("Plugin '{name}' execution error: {message}")]
    Execution { name: String, message: String },

    /// Invalid plugin configuration.
    #[error("Invalid plugin configuration: {message}")]
    Config { message: String },

    /// No runtime handles this bundle's extension.
    #[error("No runtime registered for '.{extension}' bundles")]
    RuntimeNotAvailable { extension: String },

    /// Flag persistence failed.
    #[error(transparent)]
    Settings(#[from] bench_core::SettingsError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Create an execution error.
    pub fn execution(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Execution {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}

/// A single installable bundle in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// File name, unique within the store.
    pub id: String,

    /// Location on disk.
    pub path: PathBuf,

    /// Persisted enabled flag.
    pub enabled: bool,
}

impl Bundle {
    /// Extension of the bundle file, without the dot.
    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }
}

/// Why a bundle ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BundleFailure {
    /// The loader rejected the bundle.
    Load(LoadError),

    /// An instance raised from `start()`.
    Start { instance: String, message: String },

    /// Every instance exceeded its start budget.
    Timeout { instance: String, timeout_ms: u64 },
}

impl std::fmt::Display for BundleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(e) => write!(f, "{}", e.cause),
            Self::Start { instance, message } => write!(f, "'{instance}' failed to start: {message}"),
            Self::Timeout {
                instance,
                timeout_ms,
            } => write!(f, "'{instance}' did not start within {timeout_ms}ms"),
        }
    }
}

/// Per-run state of a bundle.
///
/// `Discovered → {Disabled | Loading → (Started | Failed)}`. Only the enabled
/// flag survives a restart; every run begins at `Discovered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BundleState {
    Discovered,
    Disabled,
    Loading,
    Started,
    Failed(BundleFailure),
}

impl BundleState {
    /// Whether the bundle reached a final state for this run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disabled | Self::Started | Self::Failed(_))
    }

    /// Whether the bundle has live instances.
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// The failure reason, if any.
    pub fn failure(&self) -> Option<&BundleFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// State of a single plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "state", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceState {
    Loaded,
    Started,
    Failed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_display() {
        let err = LoadError::new("broken.plugin", "syntax error near 'end'");
        assert_eq!(
            err.to_string(),
            "Failed to load bundle 'broken.plugin': syntax error near 'end'"
        );
    }

    #[test]
    fn test_plugin_error_from_load_error_is_transparent() {
        let err: PluginError = LoadError::new("a.lua", "boom").into();
        assert!(matches!(err, PluginError::Load(_)));
        assert!(err.to_string().contains("a.lua"));
    }

    #[test]
    fn test_bundle_state_display() {
        assert_eq!(BundleState::Started.to_string(), "started");
        assert_eq!(BundleState::Disabled.to_string(), "disabled");
        let failed = BundleState::Failed(BundleFailure::Load(LoadError::new("x", "y")));
        assert_eq!(failed.to_string(), "failed");
        assert!(failed.is_terminal());
        assert!(!BundleState::Loading.is_terminal());
    }

    #[test]
    fn test_bundle_state_serializes_as_plain_data() {
        let state = BundleState::Failed(BundleFailure::Timeout {
            instance: "slow".into(),
            timeout_ms: 100,
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["failure"]["kind"], "timeout");
        assert_eq!(json["failure"]["instance"], "slow");

        let json = serde_json::to_value(BundleState::Started).unwrap();
        assert_eq!(json["state"], "started");
    }

    #[test]
    fn test_bundle_extension() {
        let bundle = Bundle {
            id: "weather.plugin".into(),
            path: PathBuf::from("/store/weather.plugin"),
            enabled: true,
        };
        assert_eq!(bundle.extension(), Some("plugin"));
    }
}
