//! The interface every plugin implementation satisfies.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::types::{InstanceState, PluginResult};

/// A capability exposed by a plugin bundle.
///
/// Implementations are produced by a [`PluginRuntime`](crate::PluginRuntime)
/// and driven by the lifecycle manager. `start` and `stop` always run on a
/// blocking worker thread, never on the caller's event loop.
pub trait Capability: Send + Sync {
    /// Self-reported name. Must not block.
    fn name(&self) -> &str;

    /// Start the plugin. May perform side effects and block briefly.
    fn start(&self) -> PluginResult<()>;

    /// Release resources. Best-effort; failures are logged, never propagated.
    fn stop(&self) -> PluginResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// A loaded capability together with its per-run bookkeeping.
#[derive(Clone)]
pub struct PluginInstance {
    /// Name reported by the capability at load time.
    pub name: String,

    /// Bundle that produced this instance.
    pub bundle_id: String,

    /// Current state.
    pub state: InstanceState,

    capability: Arc<dyn Capability>,

    /// Held for the duration of a call; shared by instances of one bundle.
    turn: Arc<Mutex<()>>,
}

impl PluginInstance {
    /// Wrap a freshly loaded capability.
    pub fn new(bundle_id: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        Self::with_turn(bundle_id.into(), capability, Arc::default())
    }

    /// Wrap every capability of one bundle. Calls into them take turns.
    pub fn for_bundle(
        bundle_id: &str,
        capabilities: impl IntoIterator<Item = Arc<dyn Capability>>,
    ) -> Vec<Self> {
        let turn: Arc<Mutex<()>> = Arc::default();
        capabilities
            .into_iter()
            .map(|capability| Self::with_turn(bundle_id.to_string(), capability, Arc::clone(&turn)))
            .collect()
    }

    fn with_turn(bundle_id: String, capability: Arc<dyn Capability>, turn: Arc<Mutex<()>>) -> Self {
        Self {
            name: capability.name().to_string(),
            bundle_id,
            state: InstanceState::Loaded,
            capability,
            turn,
        }
    }

    /// Shared handle to the capability, for moving onto a worker thread.
    pub fn capability(&self) -> Arc<dyn Capability> {
        Arc::clone(&self.capability)
    }

    /// The bundle-wide call lock, for moving onto a worker thread.
    pub(crate) fn turn(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.turn)
    }

    /// Plain-data view of this instance.
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            name: self.name.clone(),
            bundle_id: self.bundle_id.clone(),
            state: self.state.clone(),
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("bundle_id", &self.bundle_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Plain-data description of a plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub name: String,
    pub bundle_id: String,
    pub state: InstanceState,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named;

    impl Capability for Named {
        fn name(&self) -> &str {
            "weather"
        }

        fn start(&self) -> PluginResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_capability_results_are_debuggable() {
        let loaded: PluginResult<Vec<Arc<dyn Capability>>> = Ok(vec![Arc::new(Named)]);
        let rendered = format!("{loaded:?}");
        assert!(rendered.contains("weather"), "{rendered}");
        assert!(loaded.is_ok());

        let instance = PluginInstance::new("weather.lua", Arc::new(Named));
        assert_eq!(instance.info().state, InstanceState::Loaded);
        assert!(instance.capability().stop().is_ok());
    }

    #[test]
    fn test_instances_of_one_bundle_share_a_turn() {
        let caps: Vec<Arc<dyn Capability>> = vec![Arc::new(Named), Arc::new(Named)];
        let instances = PluginInstance::for_bundle("pair.lua", caps);
        assert!(Arc::ptr_eq(&instances[0].turn(), &instances[1].turn()));
        assert_eq!(instances[1].bundle_id, "pair.lua");

        let other = PluginInstance::new("solo.lua", Arc::new(Named));
        assert!(!Arc::ptr_eq(&instances[0].turn(), &other.turn()));
    }
}
