//! The bundle store: one directory of bundle files plus persisted flags.
//!
//! The directory is the source of truth for which bundles exist; the flag
//! store only remembers which of them are enabled. A bundle without a flag
//! is enabled.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use bench_core::{Settings, atomic};

use crate::config::{FLAG_PREFIX, PluginConfig, normalize_extension};
use crate::types::{Bundle, PluginError, PluginResult};

/// Persistence for per-bundle enabled flags.
///
/// `set` and `remove` must be durable before they return.
pub trait FlagStore: Send {
    /// Recorded flag for a bundle, if any.
    fn get(&self, id: &str) -> Option<bool>;

    /// Record a flag.
    fn set(&mut self, id: &str, enabled: bool) -> PluginResult<()>;

    /// Forget a flag. Returns whether one was recorded.
    fn remove(&mut self, id: &str) -> PluginResult<bool>;

    /// Ids of all recorded flags.
    fn ids(&self) -> Vec<String>;
}

/// Flags kept in the application settings file as `plugin.<id>` keys.
#[derive(Debug)]
pub struct SettingsFlagStore {
    settings: Settings,
}

impl SettingsFlagStore {
    /// Wrap loaded settings.
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Load the settings file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        Ok(Self::new(Settings::load(path)?))
    }

    fn key(id: &str) -> String {
        format!("{FLAG_PREFIX}{id}")
    }
}

impl FlagStore for SettingsFlagStore {
    fn get(&self, id: &str) -> Option<bool> {
        let key = Self::key(id);
        self.settings
            .contains(&key)
            .then(|| self.settings.get_bool(&key, true))
    }

    fn set(&mut self, id: &str, enabled: bool) -> PluginResult<()> {
        self.settings.set_bool(Self::key(id), enabled)?;
        Ok(())
    }

    fn remove(&mut self, id: &str) -> PluginResult<bool> {
        Ok(self.settings.remove(&Self::key(id))?)
    }

    fn ids(&self) -> Vec<String> {
        self.settings
            .keys_with_prefix(FLAG_PREFIX)
            .map(str::to_string)
            .collect()
    }
}

/// In-memory flags, for tests and embedders that persist elsewhere.
#[derive(Debug, Default, Clone)]
pub struct MemoryFlagStore {
    flags: BTreeMap<String, bool>,
}

impl MemoryFlagStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn get(&self, id: &str) -> Option<bool> {
        self.flags.get(id).copied()
    }

    fn set(&mut self, id: &str, enabled: bool) -> PluginResult<()> {
        self.flags.insert(id.to_string(), enabled);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> PluginResult<bool> {
        Ok(self.flags.remove(id).is_some())
    }

    fn ids(&self) -> Vec<String> {
        self.flags.keys().cloned().collect()
    }
}

/// Directory of installed bundles and their enabled flags.
///
/// Every mutation holds the writer lock for its whole duration, so the
/// file operation and the flag update of one call are never interleaved
/// with another call's.
pub struct BundleStore {
    dir: PathBuf,
    extensions: Vec<String>,
    flags: Mutex<Box<dyn FlagStore>>,
}

impl BundleStore {
    /// Open the store described by `config`, with flags in its settings file.
    pub fn open(config: &PluginConfig, extensions: Vec<String>) -> PluginResult<Self> {
        let flags = SettingsFlagStore::open(&config.settings_path)?;
        Self::with_flags(&config.plugin_dir, extensions, Box::new(flags))
    }

    /// Open a store over `dir` with a custom flag store.
    pub fn with_flags(
        dir: impl Into<PathBuf>,
        extensions: Vec<String>,
        flags: Box<dyn FlagStore>,
    ) -> PluginResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            extensions: extensions.iter().map(|e| normalize_extension(e)).collect(),
            flags: Mutex::new(flags),
        })
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn FlagStore>> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a file name denotes a bundle.
    fn is_bundle_name(&self, name: &str) -> bool {
        if atomic::is_temp_name(name) {
            return false;
        }
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&normalize_extension(e)))
    }

    /// Validate an id and return where its file would live.
    fn bundle_path(&self, id: &str) -> PluginResult<PathBuf> {
        let plain = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && self.is_bundle_name(id);
        if !plain {
            return Err(PluginError::not_found(id));
        }
        Ok(self.dir.join(id))
    }

    /// All bundles currently in the store, sorted by id.
    pub fn list_bundles(&self) -> PluginResult<Vec<Bundle>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let flags = self.lock();
        let mut bundles = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.is_bundle_name(&id) || !path.is_file() {
                continue;
            }
            let enabled = flags.get(&id).unwrap_or(true);
            bundles.push(Bundle { id, path, enabled });
        }

        bundles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bundles)
    }

    /// Look up one bundle.
    pub fn get(&self, id: &str) -> PluginResult<Bundle> {
        let path = self.bundle_path(id)?;
        if !path.is_file() {
            return Err(PluginError::not_found(id));
        }
        let enabled = self.lock().get(id).unwrap_or(true);
        Ok(Bundle {
            id: id.to_string(),
            path,
            enabled,
        })
    }

    /// Persist a bundle's enabled flag.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> PluginResult<Bundle> {
        let path = self.bundle_path(id)?;
        let mut flags = self.lock();
        if !path.is_file() {
            return Err(PluginError::not_found(id));
        }
        flags.set(id, enabled)?;
        tracing::info!(bundle = id, enabled, "Updated bundle flag");
        Ok(Bundle {
            id: id.to_string(),
            path,
            enabled,
        })
    }

    /// Copy a bundle file into the store and enable it.
    ///
    /// Replaces a bundle with the same file name.
    pub fn install(&self, source: &Path) -> PluginResult<Bundle> {
        let invalid = |message: &str| PluginError::InvalidBundle {
            path: source.to_path_buf(),
            message: message.to_string(),
        };

        let metadata = fs::metadata(source).map_err(|e| invalid(&e.to_string()))?;
        if !metadata.is_file() {
            return Err(invalid("not a regular file"));
        }
        let id = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("file name is not valid UTF-8"))?
            .to_string();
        if !self.is_bundle_name(&id) {
            return Err(invalid(&format!(
                "unsupported extension (expected one of: {})",
                self.extensions.join(", ")
            )));
        }

        let dest = self.dir.join(&id);
        let mut flags = self.lock();
        atomic::copy_atomic(source, &dest).map_err(|e| PluginError::Conflict {
            id: id.clone(),
            message: e.to_string(),
        })?;
        flags.set(&id, true)?;

        tracing::info!(bundle = %id, source = %source.display(), "Installed bundle");
        Ok(Bundle {
            id,
            path: dest,
            enabled: true,
        })
    }

    /// Delete a bundle file, then its flag.
    ///
    /// Succeeds if either existed, so a flag left behind by an interrupted
    /// removal is cleaned up by removing again.
    pub fn remove(&self, id: &str) -> PluginResult<()> {
        let path = self.bundle_path(id)?;
        let mut flags = self.lock();

        let had_file = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let had_flag = flags.remove(id)?;

        if !had_file && !had_flag {
            return Err(PluginError::not_found(id));
        }
        tracing::info!(bundle = id, had_file, had_flag, "Removed bundle");
        Ok(())
    }

    /// Drop flags whose bundle file no longer exists. Returns their ids.
    pub fn reconcile(&self) -> PluginResult<Vec<String>> {
        let mut flags = self.lock();
        let mut dropped = Vec::new();
        for id in flags.ids() {
            if self.dir.join(&id).is_file() {
                continue;
            }
            flags.remove(&id)?;
            dropped.push(id);
        }

        if !dropped.is_empty() {
            tracing::info!(count = dropped.len(), ids = ?dropped, "Dropped stale bundle flags");
        }
        Ok(dropped)
    }
}

impl std::fmt::Debug for BundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleStore")
            .field("dir", &self.dir)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        vec!["lua".into(), "plugin".into(), "rhai".into()]
    }

    fn memory_store(dir: &Path) -> BundleStore {
        BundleStore::with_flags(dir, extensions(), Box::new(MemoryFlagStore::new())).unwrap()
    }

    #[test]
    fn test_list_defaults_to_enabled_and_sorts() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.lua"), "").unwrap();
        fs::write(dir.path().join("a.plugin"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(dir.path().join(".bench-x.partial"), "").unwrap();
        fs::create_dir(dir.path().join("dir.lua")).unwrap();

        let store = memory_store(dir.path());
        let bundles = store.list_bundles().unwrap();

        let ids: Vec<&str> = bundles.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a.plugin", "b.lua"]);
        assert!(bundles.iter().all(|b| b.enabled));
    }

    #[test]
    fn test_set_enabled_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(dir.path());
        assert!(matches!(
            store.set_enabled("ghost.lua", false),
            Err(PluginError::NotFound { .. })
        ));
    }

    #[test]
    fn test_set_enabled_is_reflected_in_listing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.lua"), "").unwrap();
        let store = memory_store(dir.path());

        store.set_enabled("a.lua", false).unwrap();
        assert!(!store.get("a.lua").unwrap().enabled);
        assert!(!store.list_bundles().unwrap()[0].enabled);
    }

    #[test]
    fn test_install_rejects_unknown_extension() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let file = src.path().join("legacy.jar");
        fs::write(&file, "PK").unwrap();

        let store = memory_store(dir.path());
        assert!(matches!(
            store.install(&file),
            Err(PluginError::InvalidBundle { .. })
        ));
        assert!(store.list_bundles().unwrap().is_empty());
    }

    #[test]
    fn test_install_rejects_directory() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let sub = src.path().join("pack.lua");
        fs::create_dir(&sub).unwrap();

        let store = memory_store(dir.path());
        assert!(matches!(
            store.install(&sub),
            Err(PluginError::InvalidBundle { .. })
        ));
    }

    #[test]
    fn test_install_overwrites_and_enables() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let file = src.path().join("w.lua");
        fs::write(&file, "v1").unwrap();

        let store = memory_store(dir.path());
        store.install(&file).unwrap();
        store.set_enabled("w.lua", false).unwrap();

        fs::write(&file, "v2").unwrap();
        let bundle = store.install(&file).unwrap();
        assert!(bundle.enabled);
        assert_eq!(fs::read_to_string(dir.path().join("w.lua")).unwrap(), "v2");
        assert!(store.get("w.lua").unwrap().enabled);
    }

    #[test]
    fn test_remove_twice_reports_not_found() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.lua"), "").unwrap();
        let store = memory_store(dir.path());
        store.set_enabled("a.lua", true).unwrap();

        store.remove("a.lua").unwrap();
        assert!(!dir.path().join("a.lua").exists());
        assert!(matches!(
            store.remove("a.lua"),
            Err(PluginError::NotFound { .. })
        ));
    }

    #[test]
    fn test_remove_cleans_stale_flag() {
        let dir = TempDir::new().unwrap();
        let mut flags = MemoryFlagStore::new();
        flags.set("gone.lua", false).unwrap();
        let store = BundleStore::with_flags(dir.path(), extensions(), Box::new(flags)).unwrap();

        store.remove("gone.lua").unwrap();
        assert!(store.reconcile().unwrap().is_empty());
    }

    #[test]
    fn test_path_like_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(dir.path());
        for id in ["", "..", "../x.lua", "a/b.lua", ".bench-1.partial"] {
            assert!(
                matches!(store.remove(id), Err(PluginError::NotFound { .. })),
                "{id}"
            );
        }
    }

    #[test]
    fn test_reconcile_drops_orphan_flags() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("kept.lua"), "").unwrap();
        let mut flags = MemoryFlagStore::new();
        flags.set("kept.lua", false).unwrap();
        flags.set("orphan.lua", true).unwrap();
        let store = BundleStore::with_flags(dir.path(), extensions(), Box::new(flags)).unwrap();

        assert_eq!(store.reconcile().unwrap(), vec!["orphan.lua".to_string()]);
        assert!(!store.get("kept.lua").unwrap().enabled);
    }

    #[test]
    fn test_settings_flag_store_persists() {
        let dir = TempDir::new().unwrap();
        let settings = dir.path().join("settings.toml");

        let mut flags = SettingsFlagStore::open(&settings).unwrap();
        assert_eq!(flags.get("a.lua"), None);
        flags.set("a.lua", false).unwrap();
        flags.set("b.plugin", true).unwrap();

        let reopened = SettingsFlagStore::open(&settings).unwrap();
        assert_eq!(reopened.get("a.lua"), Some(false));
        assert_eq!(reopened.get("b.plugin"), Some(true));
        assert_eq!(reopened.ids(), vec!["a.lua".to_string(), "b.plugin".to_string()]);
    }

    #[test]
    fn test_concurrent_writers_lose_no_flag() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("plugins");
        let downloads = root.path().join("downloads");
        let settings = root.path().join("settings.toml");
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(&downloads).unwrap();

        const N: usize = 8;
        for i in 0..N {
            fs::write(dir.join(format!("toggle{i}.lua")), "").unwrap();
            fs::write(dir.join(format!("old{i}.lua")), "").unwrap();
            fs::write(downloads.join(format!("new{i}.lua")), "").unwrap();
        }

        let flags = SettingsFlagStore::open(&settings).unwrap();
        let store = BundleStore::with_flags(&dir, extensions(), Box::new(flags)).unwrap();
        for i in 0..N {
            store.set_enabled(&format!("old{i}.lua"), false).unwrap();
        }

        std::thread::scope(|scope| {
            for i in 0..N {
                let store = &store;
                let downloads = &downloads;
                scope.spawn(move || store.set_enabled(&format!("toggle{i}.lua"), i % 2 == 0).unwrap());
                scope.spawn(move || store.install(&downloads.join(format!("new{i}.lua"))).unwrap());
                scope.spawn(move || store.remove(&format!("old{i}.lua")).unwrap());
            }
        });

        let reopened = SettingsFlagStore::open(&settings).unwrap();
        for i in 0..N {
            assert_eq!(reopened.get(&format!("toggle{i}.lua")), Some(i % 2 == 0));
            assert_eq!(reopened.get(&format!("new{i}.lua")), Some(true));
            assert_eq!(reopened.get(&format!("old{i}.lua")), None);
        }
        assert_eq!(reopened.ids().len(), 2 * N);
        assert_eq!(store.list_bundles().unwrap().len(), 2 * N);
    }
}
