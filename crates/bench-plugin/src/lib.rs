//! Plugin subsystem for The Bench.
//!
//! Third-party code arrives as *bundles*: single script files dropped into a
//! store directory. This crate finds them, remembers which are enabled,
//! evaluates each one in its own sandboxed VM and starts the plugins it
//! declares, without letting one broken bundle affect the others or the host.
//!
//! # Architecture
//!
//! - [`BundleStore`] owns the bundle directory and the persisted enabled
//!   flags (through a [`FlagStore`]).
//! - [`Loader`] maps extensions to [`PluginRuntime`]s (Lua and Rhai are
//!   built in) and turns a bundle into [`PluginInstance`]s, converting every
//!   failure into a [`LoadError`].
//! - [`LifecycleManager`] runs each bundle through
//!   `Discovered → {Disabled | Loading → (Started | Failed)}` once per run
//!   and exposes install, toggle and remove.
//!
//! # Example
//!
//! ```ignore
//! use bench_plugin::{LifecycleManager, PluginConfig};
//!
//! let manager = LifecycleManager::open(&PluginConfig::default())?;
//! for report in manager.startup().await? {
//!     println!("{}: {}", report.bundle_id, report.state);
//! }
//!
//! let outcome = manager.toggle("weather.plugin", false)?;
//! assert!(outcome.restart_required);
//! ```

mod config;
mod contract;
mod lifecycle;
mod loader;
pub mod lua;
pub mod rhai;
mod runtime;
mod sandbox;
mod store;
mod types;

pub use config::{FLAG_PREFIX, PluginConfig};
pub use contract::{Capability, InstanceInfo, PluginInstance};
pub use lifecycle::{
    BundleReport, EVENT_CHANNEL_SIZE, InstallOutcome, InstalledBundle, LifecycleEvent,
    LifecycleManager, RemoveOutcome, ToggleOutcome,
};
pub use loader::Loader;
pub use runtime::PluginRuntime;
pub use sandbox::{DEADLINE_MESSAGE, Deadline, DeadlineGuard, Permission, SandboxConfig};
pub use store::{BundleStore, FlagStore, MemoryFlagStore, SettingsFlagStore};
pub use types::{
    Bundle, BundleFailure, BundleState, InstanceState, LoadError, PluginError, PluginResult,
};
