//! Plugin lifecycle management.
//!
//! The [`LifecycleManager`] drives every bundle through
//! `Discovered → {Disabled | Loading → (Started | Failed)}` once per run and
//! exposes the operations a front end needs: list, install, toggle, remove.
//!
//! Enabling or disabling a bundle only changes its persisted flag. Code that
//! is already running is never unloaded; such changes report
//! `restart_required` instead.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PluginConfig;
use crate::contract::{Capability, InstanceInfo, PluginInstance};
use crate::loader::{Loader, panic_message};
use crate::store::BundleStore;
use crate::types::{
    Bundle, BundleFailure, BundleState, InstanceState, LoadError, PluginError, PluginResult,
};

/// Channel buffer size for lifecycle events.
pub const EVENT_CHANNEL_SIZE: usize = 100;

/// Progress reported while bundles are processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A bundle moved to a new state.
    StateChanged { bundle_id: String, state: BundleState },

    /// A startup pass finished.
    StartupComplete {
        started: usize,
        failed: usize,
        disabled: usize,
    },
}

/// Outcome of running the pipeline for one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleReport {
    pub bundle_id: String,
    pub state: BundleState,
    pub instances: Vec<InstanceInfo>,
}

/// A row of [`LifecycleManager::list_installed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledBundle {
    pub id: String,
    pub enabled: bool,
    pub state: BundleState,
    pub instances: Vec<InstanceInfo>,
}

/// Result of [`LifecycleManager::install`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub bundle: Bundle,
    pub state: BundleState,
    pub instances: Vec<InstanceInfo>,
    /// The id was already running; the new file takes effect after a restart.
    pub restart_required: bool,
}

/// Result of [`LifecycleManager::toggle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToggleOutcome {
    pub id: String,
    pub enabled: bool,
    pub state: BundleState,
    pub restart_required: bool,
}

/// Result of [`LifecycleManager::remove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveOutcome {
    pub id: String,
    pub restart_required: bool,
}

#[derive(Debug)]
struct BundleEntry {
    state: BundleState,
    instances: Vec<PluginInstance>,
}

impl Default for BundleEntry {
    fn default() -> Self {
        Self {
            state: BundleState::Discovered,
            instances: Vec::new(),
        }
    }
}

impl BundleEntry {
    fn infos(&self) -> Vec<InstanceInfo> {
        self.instances.iter().map(PluginInstance::info).collect()
    }
}

/// How a single `start`/`stop` call ended.
enum CallOutcome {
    Done,
    Failed(String),
    TimedOut,
}

type CapabilityCall = fn(&dyn Capability) -> PluginResult<()>;

/// Orchestrates discovery, loading and starting of plugin bundles.
pub struct LifecycleManager {
    store: Arc<BundleStore>,
    loader: Arc<Loader>,
    entries: Mutex<HashMap<String, BundleEntry>>,
    events: Option<mpsc::Sender<LifecycleEvent>>,
    cancel: CancellationToken,
    timeout: Duration,
    /// How long a call may wait for its bundle's turn.
    queue_limit: Duration,
}

impl LifecycleManager {
    /// Create a manager over an existing store and loader.
    ///
    /// The start budget is the loader's sandbox timeout.
    pub fn new(store: BundleStore, loader: Loader) -> Self {
        let timeout = loader.sandbox().timeout();
        let queue_limit = loader.sandbox().hard_limit();
        Self {
            store: Arc::new(store),
            loader: Arc::new(loader),
            entries: Mutex::new(HashMap::new()),
            events: None,
            cancel: CancellationToken::new(),
            timeout,
            queue_limit,
        }
    }

    /// Open the store and loader described by `config`.
    pub fn open(config: &PluginConfig) -> PluginResult<Self> {
        let loader = Loader::with_default_runtimes(config);
        let store = BundleStore::open(config, loader.extensions())?;
        Ok(Self::new(store, loader))
    }

    /// Report progress on `tx`.
    pub fn with_event_sender(mut self, tx: mpsc::Sender<LifecycleEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// The underlying bundle store.
    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Current state of a bundle in this run, if it has been seen.
    pub fn state(&self, id: &str) -> Option<BundleState> {
        self.lock().get(id).map(|e| e.state.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BundleEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: LifecycleEvent) {
        // Progress is advisory; a full or closed channel drops the event.
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                tracing::trace!("Lifecycle event dropped");
            }
        }
    }

    fn report(&self, id: &str) -> BundleReport {
        let entries = self.lock();
        let entry = entries.get(id);
        BundleReport {
            bundle_id: id.to_string(),
            state: entry.map_or(BundleState::Discovered, |e| e.state.clone()),
            instances: entry.map(BundleEntry::infos).unwrap_or_default(),
        }
    }

    /// Move a bundle into `next` unless it was already processed this run.
    ///
    /// With `retry`, bundles that ended `Disabled` or `Failed` may run again.
    fn claim(&self, id: &str, retry: bool, next: &BundleState) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(id.to_string()).or_default();
        let allowed = match entry.state {
            BundleState::Discovered => true,
            BundleState::Disabled | BundleState::Failed(_) => retry,
            BundleState::Loading | BundleState::Started => false,
        };
        if allowed {
            entry.state = next.clone();
            entry.instances.clear();
        }
        allowed
    }

    fn finish(&self, id: &str, state: BundleState, instances: Vec<PluginInstance>) {
        {
            let mut entries = self.lock();
            let entry = entries.entry(id.to_string()).or_default();
            entry.state = state.clone();
            entry.instances = instances;
        }
        self.emit(LifecycleEvent::StateChanged {
            bundle_id: id.to_string(),
            state,
        });
    }

    /// Discover every bundle and start the enabled ones.
    ///
    /// Bundles are processed concurrently. A bundle that fails never fails
    /// the pass; only a store that cannot be listed does.
    pub async fn startup(&self) -> PluginResult<Vec<BundleReport>> {
        if let Err(e) = self.store.reconcile() {
            tracing::warn!("Could not reconcile bundle flags: {}", e);
        }

        let bundles = self.store.list_bundles()?;
        tracing::info!(count = bundles.len(), dir = %self.store.dir().display(), "Starting plugin bundles");

        {
            let mut entries = self.lock();
            for bundle in &bundles {
                entries.entry(bundle.id.clone()).or_default();
            }
        }

        let reports = join_all(
            bundles
                .into_iter()
                .map(|bundle| self.run_pipeline(bundle, false)),
        )
        .await;

        let count = |pred: fn(&BundleState) -> bool| reports.iter().filter(|r| pred(&r.state)).count();
        let started = count(BundleState::is_started);
        let failed = count(|s| matches!(s, BundleState::Failed(_)));
        let disabled = count(|s| matches!(s, BundleState::Disabled));

        tracing::info!(started, failed, disabled, "Plugin startup complete");
        self.emit(LifecycleEvent::StartupComplete {
            started,
            failed,
            disabled,
        });
        Ok(reports)
    }

    /// Run [`startup`](Self::startup) on a background task.
    pub fn spawn_startup(self: &Arc<Self>) -> JoinHandle<PluginResult<Vec<BundleReport>>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.startup().await })
    }

    /// Copy a bundle into the store, enable it and run it.
    ///
    /// Load and start failures are reported in the returned state, not as
    /// errors.
    pub async fn install(&self, source: &Path) -> PluginResult<InstallOutcome> {
        let store = Arc::clone(&self.store);
        let src = source.to_path_buf();
        let bundle = tokio::task::spawn_blocking(move || store.install(&src))
            .await
            .map_err(|e| PluginError::Io(io::Error::other(e)))??;

        if let Some(state @ (BundleState::Started | BundleState::Loading)) = self.state(&bundle.id) {
            tracing::info!(bundle = %bundle.id, "Replaced a running bundle; restart required");
            let instances = self.report(&bundle.id).instances;
            return Ok(InstallOutcome {
                bundle,
                state,
                instances,
                restart_required: true,
            });
        }

        let report = self.run_pipeline(bundle.clone(), true).await;
        Ok(InstallOutcome {
            bundle,
            state: report.state,
            instances: report.instances,
            restart_required: false,
        })
    }

    /// Run [`install`](Self::install) on a background task.
    pub fn spawn_install(self: &Arc<Self>, source: PathBuf) -> JoinHandle<PluginResult<InstallOutcome>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.install(&source).await })
    }

    /// Persist a bundle's enabled flag.
    ///
    /// Never starts or stops code in this run.
    pub fn toggle(&self, id: &str, enabled: bool) -> PluginResult<ToggleOutcome> {
        self.store.set_enabled(id, enabled)?;
        let state = self.state(id).unwrap_or(BundleState::Discovered);
        let restart_required = state.is_terminal() && state.is_started() != enabled;

        if restart_required {
            tracing::info!(bundle = id, enabled, "Flag changed; takes effect after restart");
        }
        Ok(ToggleOutcome {
            id: id.to_string(),
            enabled,
            state,
            restart_required,
        })
    }

    /// Delete a bundle and its flag.
    pub fn remove(&self, id: &str) -> PluginResult<RemoveOutcome> {
        self.store.remove(id)?;

        let mut entries = self.lock();
        let restart_required = entries.get(id).is_some_and(|e| e.state.is_started());
        // A started bundle keeps its entry so shutdown can still stop it.
        if !restart_required {
            entries.remove(id);
        }
        Ok(RemoveOutcome {
            id: id.to_string(),
            restart_required,
        })
    }

    /// Installed bundles with their flags and states in this run.
    pub fn list_installed(&self) -> PluginResult<Vec<InstalledBundle>> {
        let bundles = self.store.list_bundles()?;
        let entries = self.lock();
        Ok(bundles
            .into_iter()
            .map(|bundle| {
                let entry = entries.get(&bundle.id);
                InstalledBundle {
                    state: entry.map_or(BundleState::Discovered, |e| e.state.clone()),
                    instances: entry.map(BundleEntry::infos).unwrap_or_default(),
                    id: bundle.id,
                    enabled: bundle.enabled,
                }
            })
            .collect())
    }

    /// Stop every started instance and cancel a startup pass in progress.
    ///
    /// `stop()` failures are logged and otherwise ignored.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let live: Vec<(String, Vec<PluginInstance>)> = {
            let mut entries = self.lock();
            entries
                .iter_mut()
                .filter(|(_, e)| e.state.is_started())
                .map(|(id, e)| (id.clone(), std::mem::take(&mut e.instances)))
                .collect()
        };

        for (id, mut instances) in live {
            self.stop_started(&mut instances, InstanceState::Loaded).await;
            tracing::debug!(bundle = %id, "Stopped bundle");
            if let Some(entry) = self.lock().get_mut(&id) {
                entry.instances = instances;
            }
        }
    }

    async fn run_pipeline(&self, bundle: Bundle, retry: bool) -> BundleReport {
        if self.cancel.is_cancelled() {
            return self.report(&bundle.id);
        }

        let next = if bundle.enabled {
            BundleState::Loading
        } else {
            BundleState::Disabled
        };
        if !self.claim(&bundle.id, retry, &next) {
            tracing::debug!(bundle = %bundle.id, "Bundle already processed in this run");
            return self.report(&bundle.id);
        }
        self.emit(LifecycleEvent::StateChanged {
            bundle_id: bundle.id.clone(),
            state: next,
        });

        if !bundle.enabled {
            tracing::info!(bundle = %bundle.id, "Bundle disabled; not loading");
            return self.report(&bundle.id);
        }

        let instances = match self.load(&bundle).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(bundle = %bundle.id, "{}", e);
                self.finish(&bundle.id, BundleState::Failed(BundleFailure::Load(e)), Vec::new());
                return self.report(&bundle.id);
            }
        };

        let (state, instances) = self.start_instances(&bundle.id, instances).await;
        match &state {
            BundleState::Started => tracing::info!(bundle = %bundle.id, instances = instances.len(), "Bundle started"),
            BundleState::Failed(failure) => tracing::warn!(bundle = %bundle.id, "Bundle failed: {}", failure),
            _ => tracing::debug!(bundle = %bundle.id, state = %state, "Bundle not started"),
        }
        self.finish(&bundle.id, state, instances);
        self.report(&bundle.id)
    }

    /// Load a bundle on a blocking worker, bounded by the start budget.
    async fn load(&self, bundle: &Bundle) -> Result<Vec<PluginInstance>, LoadError> {
        let loader = Arc::clone(&self.loader);
        let target = bundle.clone();
        let task = tokio::task::spawn_blocking(move || loader.load(&target));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(LoadError::new(&bundle.id, format!("loader task failed: {e}"))),
            Err(_) => Err(LoadError::new(
                &bundle.id,
                format!("loading did not finish within {}ms", self.timeout.as_millis()),
            )),
        }
    }

    /// Start instances of one bundle in order.
    async fn start_instances(
        &self,
        bundle_id: &str,
        mut instances: Vec<PluginInstance>,
    ) -> (BundleState, Vec<PluginInstance>) {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let mut started = 0usize;
        let mut first_timeout: Option<String> = None;

        for i in 0..instances.len() {
            if self.cancel.is_cancelled() {
                self.stop_started(&mut instances, InstanceState::Loaded).await;
                return (BundleState::Discovered, Vec::new());
            }

            let name = instances[i].name.clone();
            match self.call(&instances[i], |c| c.start()).await {
                CallOutcome::Done => {
                    tracing::debug!(bundle = bundle_id, plugin = %name, "Plugin started");
                    instances[i].state = InstanceState::Started;
                    started += 1;
                }
                CallOutcome::TimedOut => {
                    let err = PluginError::StartTimeout {
                        name: name.clone(),
                        bundle_id: bundle_id.to_string(),
                        timeout_ms,
                    };
                    tracing::warn!(bundle = bundle_id, plugin = %name, "{}", err);
                    instances[i].state = InstanceState::Failed {
                        reason: err.to_string(),
                    };
                    first_timeout.get_or_insert(name);
                }
                CallOutcome::Failed(message) => {
                    tracing::warn!(bundle = bundle_id, plugin = %name, "Plugin failed to start: {}", message);
                    instances[i].state = InstanceState::Failed {
                        reason: message.clone(),
                    };
                    let rolled_back = InstanceState::Failed {
                        reason: format!("stopped after '{name}' failed to start"),
                    };
                    self.stop_started(&mut instances, rolled_back).await;
                    return (
                        BundleState::Failed(BundleFailure::Start {
                            instance: name,
                            message,
                        }),
                        instances,
                    );
                }
            }
        }

        if started > 0 {
            (BundleState::Started, instances)
        } else {
            let failure = BundleFailure::Timeout {
                instance: first_timeout.unwrap_or_default(),
                timeout_ms,
            };
            (BundleState::Failed(failure), instances)
        }
    }

    /// Call `stop()` on every started instance, last started first.
    async fn stop_started(&self, instances: &mut [PluginInstance], after: InstanceState) {
        for instance in instances.iter_mut().rev() {
            if instance.state != InstanceState::Started {
                continue;
            }
            match self.call(instance, |c| c.stop()).await {
                CallOutcome::Done => {}
                CallOutcome::Failed(message) => {
                    tracing::warn!(bundle = %instance.bundle_id, plugin = %instance.name, "Plugin stop failed: {}", message);
                }
                CallOutcome::TimedOut => {
                    tracing::warn!(bundle = %instance.bundle_id, plugin = %instance.name, "Plugin stop timed out");
                }
            }
            instance.state = after.clone();
        }
    }

    /// Run one capability call on a blocking worker under the start budget.
    ///
    /// Calls into one bundle take turns. The budget starts once the call
    /// holds its bundle's turn; a timed-out call keeps the turn until its VM
    /// deadline interrupts it. A call that does not get its turn within the
    /// VM hard limit is abandoned and never runs.
    async fn call(&self, instance: &PluginInstance, op: CapabilityCall) -> CallOutcome {
        let (began_tx, began_rx) = oneshot::channel::<()>();
        let decided = Arc::new(AtomicBool::new(false));

        let turn = instance.turn();
        let capability = instance.capability();
        let claimed = Arc::clone(&decided);
        let task = tokio::task::spawn_blocking(move || {
            let _turn = turn.lock().unwrap_or_else(|e| e.into_inner());
            if claimed.swap(true, Ordering::AcqRel) {
                return None;
            }
            let _ = began_tx.send(());
            Some(op(capability.as_ref()))
        });

        // Whoever flips `decided` first wins: the worker runs, or the host gives up.
        if tokio::time::timeout(self.queue_limit, began_rx).await.is_err()
            && !decided.swap(true, Ordering::AcqRel)
        {
            tracing::debug!(bundle = %instance.bundle_id, plugin = %instance.name, "Call abandoned while waiting for its turn");
            return CallOutcome::TimedOut;
        }

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) | Ok(Ok(None)) => CallOutcome::TimedOut,
            Ok(Ok(Some(Ok(())))) => CallOutcome::Done,
            Ok(Ok(Some(Err(e)))) => CallOutcome::Failed(e.to_string()),
            Ok(Err(e)) if e.is_panic() => {
                CallOutcome::Failed(format!("panicked: {}", panic_message(e.into_panic().as_ref())))
            }
            Ok(Err(e)) => CallOutcome::Failed(format!("task failed: {e}")),
        }
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("store", &self.store)
            .field("loader", &self.loader)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
