//! Node registration and periodic node status reporting.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nodelet_core::{
    ConditionStatus, Node, NodeAddress, NodeAddressType, NodeCondition, NodeConditionType,
    ResourceList,
};
use nodelet_runtime::ContainerRuntime;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::events::{reasons, EventRecorder, EventType, ObjectRef};
use crate::state::AgentState;
use crate::{AgentError, Result};

/// Attempts per status report before waiting for the next period.
pub const NODE_STATUS_UPDATE_RETRY: usize = 5;

const REGISTRATION_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const REGISTRATION_MAX_BACKOFF: Duration = Duration::from_secs(7);
const RUNTIME_UP_WAIT: Duration = Duration::from_millis(100);
const READY_REASON: &str = "nodelet is posting ready status";

/// Label carrying the node's hostname.
pub const HOSTNAME_LABEL: &str = "nodelet.io/hostname";

/// When the container runtime last answered a liveness probe.
#[derive(Debug, Default)]
pub struct NodeHealthState {
    last_runtime_up: Mutex<Option<Instant>>,
}

impl NodeHealthState {
    /// Create a state with no successful probe yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful probe now.
    pub fn record_runtime_up(&self) {
        *self.last_runtime_up.lock() = Some(Instant::now());
    }

    /// Return true if the last successful probe is within `threshold`.
    #[must_use]
    pub fn runtime_up_within(&self, threshold: Duration) -> bool {
        self.last_runtime_up
            .lock()
            .is_some_and(|at| at.elapsed() <= threshold)
    }
}

/// Probe the runtime once, allowing a short wait for it to come up.
///
/// A successful probe is recorded in `health`.
pub async fn update_runtime_up(runtime: &dyn ContainerRuntime, health: &NodeHealthState) {
    let deadline = Instant::now() + RUNTIME_UP_WAIT;
    loop {
        match runtime.version().await {
            Ok(_) => {
                health.record_runtime_up();
                return;
            }
            Err(e) if Instant::now() >= deadline => {
                warn!(error = %e, "Container runtime sanity check failed");
                return;
            }
            Err(_) => tokio::time::sleep(RUNTIME_UP_WAIT).await,
        }
    }
}

/// Keep probing the runtime every `interval`.
pub async fn run_runtime_probe(
    runtime: Arc<dyn ContainerRuntime>,
    health: Arc<NodeHealthState>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        update_runtime_up(&*runtime, &health).await;
    }
}

/// Record that the agent started on `hostname`.
pub fn record_agent_start(recorder: &dyn EventRecorder, hostname: &str) {
    recorder.event(
        &ObjectRef::node(hostname),
        EventType::Normal,
        reasons::STARTING,
        "Starting nodelet.",
    );
}

/// Registers the node and keeps its status current.
pub struct NodeStatusReporter {
    state: AgentState,
    registered: AtomicBool,
    last_unschedulable: Mutex<bool>,
}

impl NodeStatusReporter {
    /// Create a reporter.
    #[must_use]
    pub fn new(state: AgentState) -> Self {
        Self {
            state,
            registered: AtomicBool::new(false),
            last_unschedulable: Mutex::new(false),
        }
    }

    fn hostname(&self) -> &str {
        &self.state.config.hostname
    }

    /// Report status every `node_status_update_frequency`, forever.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.state.config.node_status_update_frequency());
        loop {
            ticker.tick().await;
            self.sync_node_status().await;
        }
    }

    /// Register once if configured, then report status.
    pub async fn sync_node_status(&self) {
        if self.state.config.register_node && !self.registered.load(Ordering::Acquire) {
            self.register_with_control_plane().await;
            self.registered.store(true, Ordering::Release);
        }
        if let Err(e) = self.update_node_status().await {
            error!(error = %e, "Unable to update node status");
        }
    }

    /// Build the node record to register.
    ///
    /// # Errors
    ///
    /// Returns an error if the node's addresses cannot be determined.
    pub async fn initial_node(&self) -> Result<Node> {
        let name = self.hostname().to_string();
        let mut node = Node {
            name: name.clone(),
            external_id: name.clone(),
            ..Default::default()
        };
        node.labels.insert(HOSTNAME_LABEL.to_string(), name);
        self.set_node_status(&mut node).await?;
        Ok(node)
    }

    /// Create the node record, retrying with exponential backoff until it
    /// exists.
    ///
    /// An existing record with the same external ID counts as registered.
    pub async fn register_with_control_plane(&self) {
        let mut step = REGISTRATION_INITIAL_BACKOFF;
        loop {
            if self.try_register().await {
                return;
            }
            tokio::time::sleep(step).await;
            step = (step * 2).min(REGISTRATION_MAX_BACKOFF);
        }
    }

    async fn try_register(&self) -> bool {
        let node = match self.initial_node().await {
            Ok(node) => node,
            Err(e) => {
                error!(error = %e, "Unable to construct node record");
                return false;
            }
        };
        info!(node = %node.name, "Attempting to register node");

        match self.state.control_plane.create_node(&node).await {
            Ok(created) => {
                info!(node = %node.name, "Successfully registered node");
                self.state.node_cache.set(created);
                true
            }
            Err(AgentError::AlreadyExists(_)) => {
                match self.state.control_plane.get_node(&node.name).await {
                    Ok(Some(existing)) if existing.external_id == node.external_id => {
                        info!(node = %node.name, "Node was previously registered");
                        self.state.node_cache.set(existing);
                        true
                    }
                    Ok(Some(existing)) => {
                        error!(
                            node = %node.name,
                            previous = %existing.external_id,
                            current = %node.external_id,
                            "Node previously registered with a different external ID"
                        );
                        false
                    }
                    Ok(None) => {
                        warn!(node = %node.name, "Node reported as existing but not found");
                        false
                    }
                    Err(e) => {
                        error!(node = %node.name, error = %e, "Unable to fetch existing node");
                        false
                    }
                }
            }
            Err(e) => {
                error!(node = %node.name, error = %e, "Unable to register node");
                false
            }
        }
    }

    /// Report node status, retrying a bounded number of times.
    ///
    /// # Errors
    ///
    /// Returns an error once every attempt has failed.
    pub async fn update_node_status(&self) -> Result<()> {
        for attempt in 1..=NODE_STATUS_UPDATE_RETRY {
            match self.try_update_node_status().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(attempt, error = %e, "Error updating node status, will retry");
                }
            }
        }
        Err(AgentError::ControlPlane(
            "update node status exceeds retry count".to_string(),
        ))
    }

    async fn try_update_node_status(&self) -> Result<()> {
        let name = self.hostname();
        let mut node = self
            .state
            .control_plane
            .get_node(name)
            .await?
            .ok_or_else(|| AgentError::ControlPlane(format!("no node instance returned for {name:?}")))?;
        self.set_node_status(&mut node).await?;
        let updated = self.state.control_plane.update_node_status(&node).await?;
        self.state.node_cache.set(updated);
        Ok(())
    }

    async fn node_addresses(&self) -> Result<Vec<NodeAddress>> {
        let name = self.hostname();
        let ip = if let Ok(ip) = name.parse::<IpAddr>() {
            ip
        } else {
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((name, 0))
                .await
                .map_err(|e| {
                    AgentError::ControlPlane(format!("can't get ip address of node {name}: {e}"))
                })?
                .map(|a| a.ip())
                .collect();
            addrs
                .iter()
                .find(|ip| ip.is_ipv4() && !ip.is_loopback())
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| AgentError::ControlPlane(format!("no ip address for node {name}")))?
        };
        Ok(vec![
            NodeAddress {
                address_type: NodeAddressType::LegacyHostIP,
                address: ip.to_string(),
            },
            NodeAddress {
                address_type: NodeAddressType::InternalIP,
                address: ip.to_string(),
            },
        ])
    }

    fn record_node_status_event(&self, node: &Node, event: &str) {
        self.state.recorder.event(
            &ObjectRef::node(&node.name),
            EventType::Normal,
            event,
            &format!("Node {} status is now: {event}", node.name),
        );
    }

    /// Recompute the status fields of `node`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node's addresses cannot be determined.
    pub async fn set_node_status(&self, node: &mut Node) -> Result<()> {
        let config = &self.state.config;
        node.status.addresses = self.node_addresses().await?;

        let network_configured = !config.configure_network || node.pod_cidr.is_some();

        match self.state.machine_info.machine_info().await {
            Ok(info) => {
                node.status.capacity = info.capacity(config.max_pods);
                node.status.node_info.machine_id = info.machine_id;
                node.status.node_info.system_uuid = info.system_uuid;
                let old_boot = &node.status.node_info.boot_id;
                if !old_boot.is_empty() && *old_boot != info.boot_id {
                    self.state.recorder.event(
                        &ObjectRef::node(&node.name),
                        EventType::Warning,
                        reasons::REBOOTED,
                        &format!("Node {} has been rebooted, boot id: {}", node.name, info.boot_id),
                    );
                }
                node.status.node_info.boot_id = info.boot_id;
            }
            Err(e) => {
                error!(error = %e, "Error getting machine info");
                node.status.capacity = ResourceList::default();
            }
        }

        match self.state.runtime.version().await {
            Ok(version) => node.status.node_info.container_runtime_version = version.to_string(),
            Err(e) => error!(error = %e, "Error getting container runtime version"),
        }
        node.status.node_info.agent_version = env!("CARGO_PKG_VERSION").to_string();

        let runtime_up = self
            .state
            .health
            .runtime_up_within(config.runtime_up_threshold());
        self.set_ready_condition(node, runtime_up, network_configured);

        let mut last_unschedulable = self.last_unschedulable.lock();
        if *last_unschedulable != node.unschedulable {
            let event = if node.unschedulable {
                reasons::NODE_NOT_SCHEDULABLE
            } else {
                reasons::NODE_SCHEDULABLE
            };
            self.record_node_status_event(node, event);
            *last_unschedulable = node.unschedulable;
        }
        Ok(())
    }

    fn set_ready_condition(&self, node: &mut Node, runtime_up: bool, network_configured: bool) {
        let now = Utc::now();
        let (status, reason) = if runtime_up && network_configured {
            (ConditionStatus::True, READY_REASON.to_string())
        } else {
            let mut failed = Vec::new();
            if !runtime_up {
                failed.push("container runtime is down");
            }
            if !network_configured {
                failed.push("network not configured correctly");
            }
            (ConditionStatus::False, failed.join(","))
        };

        let mut condition = NodeCondition {
            condition_type: NodeConditionType::Ready,
            status,
            reason,
            last_heartbeat_time: now,
            last_transition_time: now,
        };

        let previous = node
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == NodeConditionType::Ready);
        let transitioned = match previous {
            Some(existing) => {
                let changed = existing.status != condition.status;
                if !changed {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
                changed
            }
            None => {
                node.status.conditions.push(condition);
                true
            }
        };

        if transitioned {
            let event = if status == ConditionStatus::True {
                reasons::NODE_READY
            } else {
                reasons::NODE_NOT_READY
            };
            debug!(node = %node.name, event, "Node readiness changed");
            self.record_node_status_event(node, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::events::mock::RecordingEventRecorder;
    use crate::machine::mock::StaticMachineInfo;
    use crate::state::mock::TestAgent;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn agent(dir: &TempDir, configure_network: bool) -> TestAgent {
        TestAgent::with_config(AgentConfig {
            hostname: "10.1.2.3".to_string(),
            root_dir: dir.path().to_path_buf(),
            configure_network,
            max_pods: 20,
            ..AgentConfig::default()
        })
    }

    fn ready(node: &Node) -> NodeCondition {
        node.ready_condition().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn registration_backs_off_until_created() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        t.control_plane.fail_create_node(3);
        let reporter = NodeStatusReporter::new(t.state.clone());

        let start = Instant::now();
        reporter.register_with_control_plane().await;
        assert_eq!(t.control_plane.create_node_calls(), 4);
        assert!(start.elapsed() >= Duration::from_millis(700));

        let node = t.control_plane.node("10.1.2.3").unwrap();
        assert_eq!(node.external_id, "10.1.2.3");
        assert_eq!(node.status.capacity.pods, 20);
        assert_eq!(node.status.capacity.cpu_millicores, 4000);
        assert_eq!(t.state.node_cache.host_ip().unwrap().to_string(), "10.1.2.3");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        t.control_plane.fail_create_node(10);
        let reporter = NodeStatusReporter::new(t.state.clone());

        let start = Instant::now();
        reporter.register_with_control_plane().await;
        // 0.1 + 0.2 + 0.4 + 0.8 + 1.6 + 3.2 + 6.4 then 7s thereafter.
        let expected = Duration::from_millis(12_700) + Duration::from_secs(7 * 3);
        assert!(start.elapsed() >= expected);
        assert!(start.elapsed() < expected + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn existing_registration_with_same_id_is_accepted() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        t.control_plane.insert_node(Node {
            name: "10.1.2.3".to_string(),
            external_id: "10.1.2.3".to_string(),
            ..Default::default()
        });
        let reporter = NodeStatusReporter::new(t.state.clone());
        reporter.register_with_control_plane().await;
        assert_eq!(t.control_plane.create_node_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_events_fire_only_on_transition() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        let reporter = NodeStatusReporter::new(t.state.clone());
        t.state.health.record_runtime_up();

        reporter.sync_node_status().await;
        assert_eq!(t.recorder.count(reasons::NODE_READY), 1);
        let first = ready(&t.control_plane.node("10.1.2.3").unwrap());
        assert_eq!(first.status, ConditionStatus::True);

        reporter.sync_node_status().await;
        assert_eq!(t.recorder.count(reasons::NODE_READY), 1);
        let second = ready(&t.control_plane.node("10.1.2.3").unwrap());
        assert_eq!(second.last_transition_time, first.last_transition_time);

        // Age the transition so a flip is observable.
        let mut stored = t.control_plane.node("10.1.2.3").unwrap();
        let old = Utc::now() - ChronoDuration::hours(1);
        stored.status.conditions[0].last_transition_time = old;
        t.control_plane.insert_node(stored);

        tokio::time::advance(Duration::from_secs(31)).await;
        reporter.sync_node_status().await;
        assert_eq!(t.recorder.count(reasons::NODE_NOT_READY), 1);
        let third = ready(&t.control_plane.node("10.1.2.3").unwrap());
        assert_eq!(third.status, ConditionStatus::False);
        assert_eq!(third.reason, "container runtime is down");
        assert!(third.last_transition_time > old);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_reasons_are_joined() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, true);
        let reporter = NodeStatusReporter::new(t.state.clone());
        let mut node = reporter.initial_node().await.unwrap();
        assert_eq!(
            ready(&node).reason,
            "container runtime is down,network not configured correctly"
        );

        t.state.health.record_runtime_up();
        node.pod_cidr = Some("10.244.0.0/24".to_string());
        reporter.set_node_status(&mut node).await.unwrap();
        assert_eq!(ready(&node).reason, READY_REASON);
        assert_eq!(t.recorder.count(reasons::NODE_READY), 1);
        assert_eq!(t.recorder.count(reasons::NODE_NOT_READY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_machine_info_reports_zero_capacity() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        let mut state = t.state.clone();
        state.machine_info = Arc::new(StaticMachineInfo::failing());
        let reporter = NodeStatusReporter::new(state);

        let node = reporter.initial_node().await.unwrap();
        assert_eq!(node.status.capacity, ResourceList::default());
    }

    #[test]
    fn agent_start_is_recorded_on_the_node() {
        let recorder = RecordingEventRecorder::new();
        record_agent_start(&recorder, "node-1");
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].object, ObjectRef::node("node-1"));
        assert_eq!(events[0].reason, reasons::STARTING);
    }

    #[tokio::test(start_paused = true)]
    async fn update_gives_up_after_retry_limit() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        let reporter = NodeStatusReporter::new(t.state.clone());
        reporter.register_with_control_plane().await;

        t.control_plane.fail_update_node(NODE_STATUS_UPDATE_RETRY);
        assert!(reporter.update_node_status().await.is_err());
        assert_eq!(t.control_plane.update_node_calls(), NODE_STATUS_UPDATE_RETRY);

        // Next period resumes normally.
        assert!(reporter.update_node_status().await.is_ok());
        assert_eq!(t.control_plane.update_node_calls(), NODE_STATUS_UPDATE_RETRY + 1);

        t.control_plane.fail_update_node(NODE_STATUS_UPDATE_RETRY - 1);
        assert!(reporter.update_node_status().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reboot_and_schedulability_events() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        let reporter = NodeStatusReporter::new(t.state.clone());
        let mut node = reporter.initial_node().await.unwrap();
        assert_eq!(t.recorder.count(reasons::REBOOTED), 0);

        node.status.node_info.boot_id = "boot-0".to_string();
        node.unschedulable = true;
        reporter.set_node_status(&mut node).await.unwrap();
        assert_eq!(t.recorder.count(reasons::REBOOTED), 1);
        assert_eq!(node.status.node_info.boot_id, "boot-1");
        assert_eq!(t.recorder.count(reasons::NODE_NOT_SCHEDULABLE), 1);

        reporter.set_node_status(&mut node).await.unwrap();
        assert_eq!(t.recorder.count(reasons::NODE_NOT_SCHEDULABLE), 1);

        node.unschedulable = false;
        reporter.set_node_status(&mut node).await.unwrap();
        assert_eq!(t.recorder.count(reasons::NODE_SCHEDULABLE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_probe_stamps_health() {
        let dir = TempDir::new().unwrap();
        let t = agent(&dir, false);
        let threshold = Duration::from_secs(30);
        assert!(!t.state.health.runtime_up_within(threshold));

        t.runtime.set_down(true);
        update_runtime_up(&*t.runtime, &t.state.health).await;
        assert!(!t.state.health.runtime_up_within(threshold));
        assert!(t.runtime.version_calls() >= 2);

        t.runtime.set_down(false);
        update_runtime_up(&*t.runtime, &t.state.health).await;
        assert!(t.state.health.runtime_up_within(threshold));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!t.state.health.runtime_up_within(threshold));
    }
}
