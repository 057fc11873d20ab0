//! Error types for settings and configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading or writing the settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file exists but is not valid TOML.
    #[error("Malformed settings file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Settings could not be serialized.
    #[error("Failed to serialize settings: {message}")]
    Serialize { message: String },

    /// The new settings file could not replace the old one.
    #[error("Failed to persist settings to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SettingsError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that can occur while loading the application configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unknown fields.
    #[error("Invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Config values failed validation.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_io_keeps_path() {
        let err = SettingsError::io(
            "/test/settings.toml",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, SettingsError::Io { .. }));
        assert!(err.to_string().contains("/test/settings.toml"));
    }

    #[test]
    fn test_config_invalid_display() {
        let err = ConfigError::Invalid {
            message: "start timeout must be positive".into(),
        };
        assert!(err.to_string().contains("start timeout"));
    }
}
