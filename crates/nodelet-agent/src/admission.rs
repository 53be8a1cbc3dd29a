//! Admission of desired pods onto this node.
//!
//! Pods that do not fit are marked `Failed` and reported through an event.
//! They stay in the desired set so their directories are not cleaned up.
//!
//! Conflicts are resolved by creation time: the oldest pod wins, whatever
//! the order pods arrived in.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use nodelet_core::{Pod, PodStatus, Protocol, ResourceList};
use tracing::{debug, warn};

use crate::disk::DiskSpaceManager;
use crate::events::{reasons, EventRecorder, EventType, ObjectRef};
use crate::machine::MachineInfoProvider;
use crate::node_cache::NodeCache;
use crate::status_manager::StatusManager;
use crate::update::{SyncPodType, SyncTypes};

/// Why a pod was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Claims a host port an older pod already holds.
    HostPortConflict,
    /// Node labels do not satisfy the pod's selector.
    NodeSelectorMismatch,
    /// Requests more than the node has left.
    CapacityExceeded,
    /// New pod while the node is short of disk.
    OutOfDisk,
}

impl Rejection {
    /// Event reason.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::HostPortConflict => reasons::HOST_PORT_CONFLICT,
            Self::NodeSelectorMismatch => reasons::NODE_SELECTOR_MISMATCH,
            Self::CapacityExceeded => reasons::CAPACITY_EXCEEDED,
            Self::OutOfDisk => reasons::OUT_OF_DISK,
        }
    }

    const fn cause(self) -> &'static str {
        match self {
            Self::HostPortConflict => "host port conflict",
            Self::NodeSelectorMismatch => "node selector mismatch",
            Self::CapacityExceeded => "exceeded capacity",
            Self::OutOfDisk => "lack of disk space",
        }
    }

    /// Event message.
    #[must_use]
    pub fn event_message(self) -> String {
        format!("Cannot start the pod due to {}.", self.cause())
    }

    /// Message on the pod's `Failed` status.
    #[must_use]
    pub fn status_message(self) -> String {
        format!("Pod cannot be started due to {}", self.cause())
    }
}

/// Split pods by whether their host ports collide with an earlier pod.
///
/// `pods` must already be in creation order.
#[must_use]
pub fn check_host_port_conflicts(pods: Vec<Pod>) -> (Vec<Pod>, Vec<Pod>) {
    let mut claimed: HashSet<(Protocol, u16)> = HashSet::new();
    let mut fitting = Vec::with_capacity(pods.len());
    let mut conflicting = Vec::new();

    for pod in pods {
        let wanted: Vec<(Protocol, u16)> = pod
            .spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .filter(|p| p.host_port != 0)
            .map(|p| (p.protocol, p.host_port))
            .collect();
        let mut seen = HashSet::new();
        let conflict = wanted
            .iter()
            .any(|key| claimed.contains(key) || !seen.insert(*key));
        if conflict {
            conflicting.push(pod);
        } else {
            claimed.extend(wanted);
            fitting.push(pod);
        }
    }
    (fitting, conflicting)
}

/// Return true if `labels` carry every key and value of `selector`.
#[must_use]
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
}

/// Split pods by whether they fit the node's capacity.
///
/// A zero capacity for a resource means unlimited. `pods` must already be in
/// creation order.
#[must_use]
pub fn check_capacity(pods: Vec<Pod>, capacity: &ResourceList) -> (Vec<Pod>, Vec<Pod>) {
    let mut used = ResourceList::default();
    let mut fitting = Vec::with_capacity(pods.len());
    let mut exceeding = Vec::new();

    for pod in pods {
        let request = pod.resource_request();
        let fits_cpu = fits(used.cpu_millicores, request.cpu_millicores, capacity.cpu_millicores);
        let fits_memory = fits(used.memory_bytes, request.memory_bytes, capacity.memory_bytes);
        let fits_count = capacity.pods == 0 || (fitting.len() as u64) < capacity.pods;
        if fits_cpu && fits_memory && fits_count {
            used = used.saturating_add(&request);
            fitting.push(pod);
        } else {
            exceeding.push(pod);
        }
    }
    (fitting, exceeding)
}

/// An overflowing sum never fits a bounded capacity.
fn fits(used: u64, request: u64, capacity: u64) -> bool {
    capacity == 0 || used.checked_add(request).is_some_and(|total| total <= capacity)
}

/// Filters desired pods down to those the node accepts.
pub struct AdmissionPipeline {
    status_manager: Arc<StatusManager>,
    recorder: Arc<dyn EventRecorder>,
    node_cache: Arc<NodeCache>,
    machine_info: Arc<dyn MachineInfoProvider>,
    disk: Arc<dyn DiskSpaceManager>,
    max_pods: u64,
}

impl AdmissionPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        status_manager: Arc<StatusManager>,
        recorder: Arc<dyn EventRecorder>,
        node_cache: Arc<NodeCache>,
        machine_info: Arc<dyn MachineInfoProvider>,
        disk: Arc<dyn DiskSpaceManager>,
        max_pods: u64,
    ) -> Self {
        Self {
            status_manager,
            recorder,
            node_cache,
            machine_info,
            disk,
            max_pods,
        }
    }

    /// Return the pods that may run, in creation order.
    pub async fn admit(&self, pods: &[Pod], sync_types: &SyncTypes) -> Vec<Pod> {
        let mut pods = self.filter_out_terminated(pods);
        pods.sort_by_key(|p| p.creation_timestamp);

        let (fitting, rejected) = check_host_port_conflicts(pods);
        self.reject_all(&rejected, Rejection::HostPortConflict);

        let (fitting, rejected) = self.check_node_selector(fitting);
        self.reject_all(&rejected, Rejection::NodeSelectorMismatch);

        let (fitting, rejected) = self.check_capacity(fitting).await;
        self.reject_all(&rejected, Rejection::CapacityExceeded);

        self.check_out_of_disk(fitting, sync_types)
    }

    fn filter_out_terminated(&self, pods: &[Pod]) -> Vec<Pod> {
        pods.iter()
            .filter(|pod| {
                let terminated = self
                    .status_manager
                    .get_pod_status(&pod.full_name())
                    .map_or_else(|| pod.status.is_terminated(), |s| s.is_terminated());
                if terminated {
                    debug!(pod = %pod.full_name(), "Skipping terminated pod");
                }
                !terminated
            })
            .cloned()
            .collect()
    }

    fn check_node_selector(&self, pods: Vec<Pod>) -> (Vec<Pod>, Vec<Pod>) {
        let node = match self.node_cache.get() {
            Ok(node) => node,
            Err(e) => {
                warn!(error = %e, "Cannot get node; skipping node selector check");
                return (pods, Vec::new());
            }
        };
        pods.into_iter()
            .partition(|p| selector_matches(&p.spec.node_selector, &node.labels))
    }

    async fn check_capacity(&self, pods: Vec<Pod>) -> (Vec<Pod>, Vec<Pod>) {
        match self.machine_info.machine_info().await {
            Ok(info) => check_capacity(pods, &info.capacity(self.max_pods)),
            Err(e) => {
                warn!(error = %e, "Cannot get machine info; skipping capacity check");
                (pods, Vec::new())
            }
        }
    }

    fn check_out_of_disk(&self, pods: Vec<Pod>, sync_types: &SyncTypes) -> Vec<Pod> {
        if sync_types.is_empty() {
            return pods;
        }
        // Measurement errors count as space available.
        let out_of_runtime_disk = matches!(self.disk.is_runtime_disk_space_available(), Ok(false));
        let out_of_root_disk = matches!(self.disk.is_root_disk_space_available(), Ok(false));
        if !out_of_runtime_disk && !out_of_root_disk {
            self.disk.unfreeze();
            return pods;
        }

        let (fitting, rejected): (Vec<Pod>, Vec<Pod>) = pods
            .into_iter()
            .partition(|p| sync_types.get(&p.uid) != Some(&SyncPodType::Create));
        self.reject_all(&rejected, Rejection::OutOfDisk);
        fitting
    }

    fn reject_all(&self, pods: &[Pod], rejection: Rejection) {
        for pod in pods {
            warn!(pod = %pod.full_name(), reason = rejection.reason(), "Rejecting pod");
            self.recorder.event(
                &ObjectRef::pod(pod),
                EventType::Warning,
                rejection.reason(),
                &rejection.event_message(),
            );
            self.status_manager
                .set_pod_status(pod, PodStatus::failed(rejection.status_message()));
        }
    }
}
