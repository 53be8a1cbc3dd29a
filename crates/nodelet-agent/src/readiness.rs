//! Container readiness results.

use std::collections::HashMap;

use nodelet_core::{ContainerId, Pod, PodStatus};
use parking_lot::RwLock;

/// Latest readiness result per container.
///
/// Keys are container IDs with the runtime prefix removed.
#[derive(Debug, Default)]
pub struct ReadinessManager {
    states: RwLock<HashMap<String, bool>>,
}

impl ReadinessManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a readiness result.
    pub fn set_readiness(&self, id: &ContainerId, ready: bool) {
        self.states.write().insert(id.trimmed().to_string(), ready);
    }

    /// Return the last result; containers never probed are not ready.
    #[must_use]
    pub fn is_ready(&self, id: &ContainerId) -> bool {
        self.states
            .read()
            .get(id.trimmed())
            .copied()
            .unwrap_or(false)
    }

    /// Forget a container.
    pub fn remove_readiness(&self, id: &ContainerId) {
        self.states.write().remove(id.trimmed());
    }

    /// Record results for every container of a pod from its runtime status.
    ///
    /// Containers declare no readiness checks, so a running container is ready
    /// and any other container is not. Results already recorded for a running
    /// container are kept.
    pub fn probe_pod(&self, pod: &Pod, status: &PodStatus) {
        let mut states = self.states.write();
        for spec in &pod.spec.containers {
            let Some(cs) = status.container_status(&spec.name) else {
                continue;
            };
            let Some(id) = &cs.container_id else {
                continue;
            };
            if cs.state.is_running() {
                states.entry(id.trimmed().to_string()).or_insert(true);
            } else {
                states.insert(id.trimmed().to_string(), false);
            }
            if let Some(previous) = cs
                .last_termination
                .as_ref()
                .and_then(|t| t.container_id.as_ref())
            {
                states.remove(previous.trimmed());
            }
        }
    }

    /// Number of tracked containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Return true if no containers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}
