//! Plugin runtime trait.
//!
//! This module defines the language-agnostic [`PluginRuntime`] trait that
//! all scripting language implementations must satisfy.

use std::path::Path;
use std::sync::Arc;

use crate::contract::Capability;
use crate::sandbox::SandboxConfig;
use crate::types::PluginResult;

/// Trait that all plugin runtime implementations must satisfy.
///
/// A runtime turns one bundle file into the capabilities it declares. Each
/// call to [`load_bundle`](PluginRuntime::load_bundle) must build a fresh,
/// private interpreter state: nothing a bundle does to its globals may be
/// visible to another bundle or to the host.
pub trait PluginRuntime: Send + Sync {
    /// Get the name of this runtime (e.g., "lua", "rhai").
    fn name(&self) -> &'static str;

    /// Get the file extensions this runtime handles natively (e.g., ["lua"]).
    fn file_extensions(&self) -> &'static [&'static str];

    /// Evaluate a bundle and instantiate every capability it declares.
    ///
    /// Does not call `start()`.
    fn load_bundle(
        &self,
        bundle_id: &str,
        source: &Path,
        sandbox: &SandboxConfig,
    ) -> PluginResult<Vec<Arc<dyn Capability>>>;
}
