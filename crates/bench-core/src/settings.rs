//! Persistent application settings.
//!
//! A flat key/value record stored as TOML. Values keep their TOML type, so
//! settings owned by other parts of the application survive untouched.
//! Every mutation is written through
//! to disk before it returns, using [`crate::atomic::write_atomic`], so a
//! crash never loses an acknowledged change or leaves a truncated file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use toml::Value;

use crate::atomic::write_atomic;
use crate::error::SettingsError;

/// File-backed application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl Settings {
    /// Load settings from `path`.
    ///
    /// A missing file yields empty settings; the file is created on the
    /// first write.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|e| SettingsError::io(&path, e))?;
            toml::from_str(&content).map_err(|e| SettingsError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), entries = values.len(), "Loaded settings");
        Ok(Self { path, values })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a string value. `None` when absent or not a string.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Get a value of any type.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a boolean value, falling back to `default` when absent.
    ///
    /// Accepts TOML booleans and the strings `"true"`/`"false"`; any other
    /// string reads as `false`, any other type as `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(Value::Boolean(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => default,
        }
    }

    /// Check whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Set a value and persist.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), SettingsError> {
        let key = key.into();
        let previous = self.values.insert(key.clone(), value.into());
        if let Err(e) = self.save() {
            match previous {
                Some(old) => self.values.insert(key, old),
                None => self.values.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Set a boolean value and persist.
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) -> Result<(), SettingsError> {
        self.set(key, value)
    }

    /// Remove a key and persist. Returns whether the key was present.
    pub fn remove(&mut self, key: &str) -> Result<bool, SettingsError> {
        let Some(old) = self.values.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.save() {
            self.values.insert(key.to_string(), old);
            return Err(e);
        }
        Ok(true)
    }

    /// Iterate over keys starting with `prefix`, with the prefix stripped.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.values
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(move |k| k.starts_with(prefix))
            .map(move |k| &k[prefix.len()..])
    }

    fn save(&self) -> Result<(), SettingsError> {
        let content = toml::to_string(&self.values).map_err(|e| SettingsError::Serialize {
            message: e.to_string(),
        })?;
        write_atomic(&self.path, content.as_bytes()).map_err(|source| SettingsError::Persist {
            path: self.path.clone(),
            source,
        })
    }
}
