//! Shared application services for The Bench.
//!
//! This crate provides the collaborators that the plugin subsystem is
//! constructed with: the persistent application settings record, the
//! application configuration, and crash-safe file replacement.

pub mod atomic;
mod config;
mod error;
mod settings;

pub use config::{APP_DIR, AppConfig, AppConfigBuilder, default_config_dir};
pub use error::{ConfigError, SettingsError};
pub use settings::Settings;
