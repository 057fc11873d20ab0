//! Turns bundle files into plugin instances.
//!
//! The loader picks a runtime by extension, asks it for a fresh VM and
//! converts every way that can go wrong (I/O, syntax, resolution, a panic
//! inside the runtime) into a [`LoadError`]. It never calls `start()`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::config::{PluginConfig, normalize_extension};
use crate::contract::PluginInstance;
use crate::lua::LuaRuntime;
use crate::rhai::RhaiRuntime;
use crate::runtime::PluginRuntime;
use crate::sandbox::SandboxConfig;
use crate::types::{Bundle, LoadError, PluginError};

/// Registry of runtimes keyed by the extensions they handle.
pub struct Loader {
    runtimes: Vec<Arc<dyn PluginRuntime>>,

    /// extension -> index into `runtimes`
    by_extension: IndexMap<String, usize>,

    sandbox: SandboxConfig,
}

impl Loader {
    /// Create a loader with no runtimes.
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self {
            runtimes: Vec::new(),
            by_extension: IndexMap::new(),
            sandbox,
        }
    }

    /// Create a loader with the Lua and Rhai runtimes and the configured aliases.
    pub fn with_default_runtimes(config: &PluginConfig) -> Self {
        let mut loader = Self::new(config.sandbox.clone());
        loader.register_runtime(Arc::new(LuaRuntime::new()));
        loader.register_runtime(Arc::new(RhaiRuntime::new()));

        for (extension, runtime) in &config.extension_aliases {
            if let Err(e) = loader.alias(extension, runtime) {
                tracing::warn!(extension = %extension, runtime = %runtime, "Ignoring extension alias: {}", e);
            }
        }
        loader
    }

    /// Register a runtime for its native extensions.
    ///
    /// A later registration takes over an extension from an earlier one.
    pub fn register_runtime(&mut self, runtime: Arc<dyn PluginRuntime>) {
        let index = self.runtimes.len();
        for ext in runtime.file_extensions() {
            self.by_extension.insert(normalize_extension(ext), index);
        }
        tracing::debug!(runtime = runtime.name(), "Registered plugin runtime");
        self.runtimes.push(runtime);
    }

    /// Route an extra extension to an already registered runtime.
    pub fn alias(&mut self, extension: &str, runtime: &str) -> Result<(), PluginError> {
        let index = self
            .runtimes
            .iter()
            .position(|r| r.name() == runtime)
            .ok_or_else(|| PluginError::Config {
                message: format!("unknown runtime '{runtime}' for extension '{extension}'"),
            })?;
        self.by_extension.insert(normalize_extension(extension), index);
        Ok(())
    }

    /// Whether files with this extension are bundles.
    pub fn handles(&self, extension: &str) -> bool {
        self.by_extension.contains_key(&normalize_extension(extension))
    }

    /// All registered extensions, without dots.
    pub fn extensions(&self) -> Vec<String> {
        self.by_extension.keys().cloned().collect()
    }

    /// Sandbox applied to every bundle.
    pub fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    fn runtime_for(&self, extension: &str) -> Option<&Arc<dyn PluginRuntime>> {
        self.by_extension
            .get(&normalize_extension(extension))
            .map(|&i| &self.runtimes[i])
    }

    /// Evaluate a bundle in a fresh VM and instantiate everything it declares.
    pub fn load(&self, bundle: &Bundle) -> Result<Vec<PluginInstance>, LoadError> {
        let extension = bundle.extension().unwrap_or_default();
        let runtime = self.runtime_for(extension).ok_or_else(|| {
            LoadError::new(
                &bundle.id,
                PluginError::RuntimeNotAvailable {
                    extension: extension.to_string(),
                }
                .to_string(),
            )
        })?;

        tracing::debug!(bundle = %bundle.id, runtime = runtime.name(), "Loading bundle");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            runtime.load_bundle(&bundle.id, &bundle.path, &self.sandbox)
        }));

        let capabilities = match outcome {
            Ok(Ok(capabilities)) => capabilities,
            Ok(Err(PluginError::Load(e))) => return Err(e),
            Ok(Err(e)) => return Err(LoadError::new(&bundle.id, e.to_string())),
            Err(panic) => {
                return Err(LoadError::new(
                    &bundle.id,
                    format!("runtime panicked: {}", panic_message(panic.as_ref())),
                ));
            }
        };

        if capabilities.is_empty() {
            return Err(LoadError::new(&bundle.id, "bundle declares no plugins"));
        }

        Ok(PluginInstance::for_bundle(&bundle.id, capabilities))
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("runtimes", &self.runtimes.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("extensions", &self.extensions())
            .finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
