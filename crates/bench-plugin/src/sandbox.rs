//! Security sandboxing for plugins.
//!
//! This module describes what bundle code may touch and how long it may
//! run. Every bundle VM is built from a [`SandboxConfig`] and owns one
//! [`Deadline`] that script code checks while it executes.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Error text used when a script is interrupted by its deadline.
pub const DEADLINE_MESSAGE: &str = "execution deadline exceeded";

/// Permission types that can be granted to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read files from the filesystem.
    Read,

    /// Write, rename or delete files.
    Write,

    /// Execute external commands.
    Execute,

    /// Access environment variables.
    Environment,

    /// Send notifications to the host.
    Notify,
}

/// Configuration for plugin sandboxing.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Paths the plugin is allowed to read from (empty = anywhere, if `Read`).
    pub allowed_read_paths: Vec<PathBuf>,

    /// Budget for loading a bundle or one `start`/`stop` call, in milliseconds.
    pub timeout_ms: u64,

    /// Extra time a script keeps running after the host gave up on it,
    /// before its VM interrupts it.
    pub grace_ms: u64,

    /// Maximum memory per bundle VM in bytes (0 = unlimited).
    pub max_memory: usize,

    /// Maximum file size that can be read.
    pub max_read_size: usize,

    /// Granted permissions.
    pub permissions: HashSet<Permission>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_read_paths: vec![],
            timeout_ms: 5000,
            grace_ms: 1000,
            max_memory: 64 * 1024 * 1024, // 64 MB
            max_read_size: 1024 * 1024,   // 1 MB
            permissions: HashSet::from([Permission::Notify]),
        }
    }
}

impl SandboxConfig {
    /// Create a minimal sandbox with no permissions.
    pub fn minimal() -> Self {
        Self {
            permissions: HashSet::new(),
            ..Self::default()
        }
    }

    /// Add an allowed read path.
    pub fn allow_read(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_read_paths.push(path.into());
        self.permissions.insert(Permission::Read);
        self
    }

    /// Set timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the grace period after a timeout.
    pub fn with_grace(mut self, grace_ms: u64) -> Self {
        self.grace_ms = grace_ms;
        self
    }

    /// Set memory limit.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Grant a permission.
    pub fn grant(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    /// Check if a permission is granted.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Check if reading a path is allowed.
    ///
    /// Paths are compared after resolving symlinks, and any path with a
    /// `..` component is refused outright when reads are restricted.
    pub fn can_read(&self, path: &Path) -> bool {
        if !self.has_permission(Permission::Read) {
            return false;
        }
        if self.allowed_read_paths.is_empty() {
            return true; // No restrictions
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return false;
        }

        let resolved = resolve(path);
        self.allowed_read_paths
            .iter()
            .any(|allowed| resolved.starts_with(resolve(allowed)))
    }

    /// The host-side budget for one call.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The VM-side budget for one call: timeout plus grace.
    pub fn hard_limit(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.saturating_add(self.grace_ms))
    }
}

/// Canonical form of `path`, or `path` itself when it does not exist.
fn resolve(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// A shared, re-armable point in time after which script code must stop.
///
/// Runtimes poll [`Deadline::expired`] from an instruction hook and abort
/// the running script once it returns `true`.
#[derive(Debug, Clone, Default)]
pub struct Deadline(Arc<Mutex<Option<Instant>>>);

impl Deadline {
    /// Create a disarmed deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline for `budget` from now; disarmed when the guard drops.
    pub fn arm(&self, budget: Duration) -> DeadlineGuard<'_> {
        // Overflowing budgets behave as "no deadline".
        self.set(Instant::now().checked_add(budget));
        DeadlineGuard(self)
    }

    /// Whether the deadline is armed and has passed.
    pub fn expired(&self) -> bool {
        let slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        slot.is_some_and(|at| Instant::now() >= at)
    }

    fn set(&self, value: Option<Instant>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

/// Disarms a [`Deadline`] on drop.
#[must_use = "the deadline is disarmed as soon as the guard is dropped"]
pub struct DeadlineGuard<'a>(&'a Deadline);

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        self.0.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sandbox_cannot_read() {
        let sandbox = SandboxConfig::default();
        assert!(!sandbox.can_read(Path::new("/etc/hosts")));
        assert!(sandbox.has_permission(Permission::Notify));
    }

    #[test]
    fn test_allow_read_restricts_to_prefix() {
        let sandbox = SandboxConfig::minimal().allow_read("/srv/data");
        assert!(sandbox.can_read(Path::new("/srv/data/feed.xml")));
        assert!(!sandbox.can_read(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_parent_components_cannot_escape_prefix() {
        let sandbox = SandboxConfig::minimal().allow_read("/srv/data");
        assert!(!sandbox.can_read(Path::new("/srv/data/../../etc/passwd")));
        assert!(!sandbox.can_read(Path::new("/srv/data/feeds/../feed.xml")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_prefix_is_refused() {
        let root = tempfile::TempDir::new().unwrap();
        let allowed = root.path().join("data");
        std::fs::create_dir(&allowed).unwrap();
        std::fs::write(root.path().join("secret.txt"), "hidden").unwrap();
        std::fs::write(allowed.join("feed.xml"), "<rss/>").unwrap();
        std::os::unix::fs::symlink(root.path().join("secret.txt"), allowed.join("link.txt"))
            .unwrap();

        let sandbox = SandboxConfig::minimal().allow_read(&allowed);
        assert!(sandbox.can_read(&allowed.join("feed.xml")));
        assert!(!sandbox.can_read(&allowed.join("link.txt")));
    }

    #[test]
    fn test_read_permission_without_paths_is_unrestricted() {
        let sandbox = SandboxConfig::minimal().grant(Permission::Read);
        assert!(sandbox.can_read(Path::new("/anywhere")));
    }

    #[test]
    fn test_hard_limit_adds_grace() {
        let sandbox = SandboxConfig::default().with_timeout(200).with_grace(50);
        assert_eq!(sandbox.timeout(), Duration::from_millis(200));
        assert_eq!(sandbox.hard_limit(), Duration::from_millis(250));
    }

    #[test]
    fn test_deadline_guard_disarms() {
        let deadline = Deadline::new();
        assert!(!deadline.expired());
        {
            let _guard = deadline.arm(Duration::ZERO);
            assert!(deadline.expired());
        }
        assert!(!deadline.expired());
    }

    #[test]
    fn test_deadline_not_expired_before_budget() {
        let deadline = Deadline::new();
        let _guard = deadline.arm(Duration::from_secs(60));
        assert!(!deadline.expired());
    }
}
