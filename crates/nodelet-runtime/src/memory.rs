//! In-process container runtime.
//!
//! [`MemoryRuntime`] tracks pods and containers in memory without starting any
//! processes. The agent uses it for dry runs; tests use its fault injection
//! and call counters to drive the agent through failure paths.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nodelet_core::{
    ContainerId, ContainerState, ContainerStatus, Pod, PodStatus, PodUid, RestartPolicy, Secret,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    ContainerRuntime, GcTarget, LogOptions, Result, RunningContainer, RunningPod, RuntimeError, RuntimeKind,
    RuntimeVersion,
};

const VERSION: &str = "1.0.0";

/// A failure to inject into status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transient "temporarily unavailable" error.
    TemporarilyUnavailable,
    /// Fail with a non-transient error carrying this message.
    Other(String),
}

impl Fault {
    fn to_error(&self) -> RuntimeError {
        match self {
            Self::TemporarilyUnavailable => {
                RuntimeError::TemporarilyUnavailable("runtime is busy".to_string())
            }
            Self::Other(msg) => RuntimeError::Other(msg.clone()),
        }
    }
}

/// An in-memory runtime.
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pods: HashMap<PodUid, MemoryPod>,
    logs: HashMap<ContainerId, Vec<String>>,
    images: HashSet<String>,
    next_container: u64,
    sync_delay: Duration,
    faults: Faults,
    stats: Stats,
}

struct MemoryPod {
    running: RunningPod,
    statuses: Vec<ContainerStatus>,
}

#[derive(Default)]
struct Faults {
    down: bool,
    list: Option<String>,
    status: Option<Fault>,
    sync: HashSet<PodUid>,
    kill: HashSet<PodUid>,
    gc: Option<String>,
}

#[derive(Default)]
struct Stats {
    syncs: HashMap<PodUid, usize>,
    last_synced: HashMap<PodUid, Pod>,
    in_flight: HashMap<PodUid, usize>,
    max_in_flight: HashMap<PodUid, usize>,
    killed: Vec<PodUid>,
    version_calls: usize,
    gc_runs: HashMap<GcTarget, usize>,
}

impl MemoryRuntime {
    /// Create an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pod as running, bypassing `sync_pod`.
    pub fn insert_running(&self, running: RunningPod) {
        let statuses = running
            .containers
            .iter()
            .map(|c| ContainerStatus {
                name: c.name.clone(),
                container_id: Some(c.id.clone()),
                state: ContainerState::running(),
                last_termination: None,
                ready: false,
                restart_count: 0,
                image: c.image.clone(),
            })
            .collect();
        self.state.lock().pods.insert(
            running.id.clone(),
            MemoryPod { running, statuses },
        );
    }

    /// Overwrite the state of one container of a pod.
    ///
    /// Returns false if the pod or container is unknown.
    pub fn set_container_state(&self, uid: &PodUid, name: &str, state: ContainerState) -> bool {
        let mut guard = self.state.lock();
        let Some(pod) = guard.pods.get_mut(uid) else {
            return false;
        };
        match pod.statuses.iter_mut().find(|s| s.name == name) {
            Some(status) => {
                status.state = state;
                true
            }
            None => false,
        }
    }

    /// Return the container ID of a container, if it exists.
    #[must_use]
    pub fn container_id(&self, uid: &PodUid, name: &str) -> Option<ContainerId> {
        let guard = self.state.lock();
        let pod = guard.pods.get(uid)?;
        pod.running
            .containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id.clone())
    }

    /// Append a log line for a container.
    pub fn append_log(&self, container_id: &ContainerId, line: impl Into<String>) {
        self.state
            .lock()
            .logs
            .entry(container_id.clone())
            .or_default()
            .push(line.into());
    }

    /// Mark the runtime as down; `version` fails until cleared.
    pub fn set_down(&self, down: bool) {
        self.state.lock().faults.down = down;
    }

    /// Make `get_pods` fail with the given message.
    pub fn fail_list(&self, message: Option<String>) {
        self.state.lock().faults.list = message;
    }

    /// Make `get_pod_status` fail.
    pub fn fail_status(&self, fault: Option<Fault>) {
        self.state.lock().faults.status = fault;
    }

    /// Make `sync_pod` fail for one pod.
    pub fn fail_sync(&self, uid: &PodUid, fail: bool) {
        let faults = &mut self.state.lock().faults;
        if fail {
            faults.sync.insert(uid.clone());
        } else {
            faults.sync.remove(uid);
        }
    }

    /// Make `kill_pod` fail for one pod.
    pub fn fail_kill(&self, uid: &PodUid, fail: bool) {
        let faults = &mut self.state.lock().faults;
        if fail {
            faults.kill.insert(uid.clone());
        } else {
            faults.kill.remove(uid);
        }
    }

    /// Make `garbage_collect` fail with the given message.
    pub fn fail_gc(&self, message: Option<String>) {
        self.state.lock().faults.gc = message;
    }

    /// Hold every `sync_pod` call for this long before applying it.
    pub fn set_sync_delay(&self, delay: Duration) {
        self.state.lock().sync_delay = delay;
    }

    /// Number of `sync_pod` calls for a pod, failed ones included.
    #[must_use]
    pub fn sync_count(&self, uid: &PodUid) -> usize {
        self.state.lock().stats.syncs.get(uid).copied().unwrap_or(0)
    }

    /// The spec passed to the most recent `sync_pod` for a pod.
    #[must_use]
    pub fn last_synced(&self, uid: &PodUid) -> Option<Pod> {
        self.state.lock().stats.last_synced.get(uid).cloned()
    }

    /// The highest number of overlapping `sync_pod` calls seen for a pod.
    #[must_use]
    pub fn max_concurrent_syncs(&self, uid: &PodUid) -> usize {
        self.state
            .lock()
            .stats
            .max_in_flight
            .get(uid)
            .copied()
            .unwrap_or(0)
    }

    /// UIDs passed to `kill_pod`, in call order.
    #[must_use]
    pub fn killed(&self) -> Vec<PodUid> {
        self.state.lock().stats.killed.clone()
    }

    /// Number of completed `garbage_collect` passes for a target.
    #[must_use]
    pub fn gc_runs(&self, target: GcTarget) -> usize {
        self.state
            .lock()
            .stats
            .gc_runs
            .get(&target)
            .copied()
            .unwrap_or(0)
    }

    /// Images pulled and not yet collected, sorted.
    #[must_use]
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self.state.lock().images.iter().cloned().collect();
        images.sort();
        images
    }

    /// Return true if logs are kept for a container.
    #[must_use]
    pub fn has_logs(&self, container_id: &ContainerId) -> bool {
        self.state.lock().logs.contains_key(container_id)
    }

    /// Number of `version` calls.
    #[must_use]
    pub fn version_calls(&self) -> usize {
        self.state.lock().stats.version_calls
    }

    fn begin_sync(&self, uid: &PodUid) -> Result<Duration> {
        let mut guard = self.state.lock();
        *guard.stats.syncs.entry(uid.clone()).or_default() += 1;
        if guard.faults.sync.contains(uid) {
            return Err(RuntimeError::Other(format!("injected sync failure for {uid}")));
        }

        let in_flight = {
            let entry = guard.stats.in_flight.entry(uid.clone()).or_default();
            *entry += 1;
            *entry
        };
        let max = guard.stats.max_in_flight.entry(uid.clone()).or_default();
        *max = (*max).max(in_flight);
        Ok(guard.sync_delay)
    }

    fn apply_sync(&self, pod: &Pod) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(n) = state.stats.in_flight.get_mut(&pod.uid) {
            *n = n.saturating_sub(1);
        }
        state.stats.last_synced.insert(pod.uid.clone(), pod.clone());

        let entry = state.pods.entry(pod.uid.clone()).or_insert_with(|| MemoryPod {
            running: RunningPod::empty(pod),
            statuses: Vec::new(),
        });

        let mut containers = Vec::with_capacity(pod.spec.containers.len());
        let mut statuses = Vec::with_capacity(pod.spec.containers.len());
        for spec in &pod.spec.containers {
            let existing = entry
                .running
                .containers
                .iter()
                .find(|c| c.name == spec.name && c.image == spec.image)
                .cloned();
            let previous = entry.statuses.iter().find(|s| s.name == spec.name).cloned();

            match (existing, previous) {
                (Some(container), Some(mut status)) => {
                    if let ContainerState::Terminated(term) = &status.state {
                        let restart = match pod.spec.restart_policy {
                            RestartPolicy::Always => true,
                            RestartPolicy::OnFailure => term.exit_code != 0,
                            RestartPolicy::Never => false,
                        };
                        if restart {
                            status.last_termination = Some(term.clone());
                            status.state = ContainerState::Running {
                                started_at: Some(Utc::now()),
                            };
                            status.restart_count += 1;
                        }
                    }
                    containers.push(container);
                    statuses.push(status);
                }
                _ => {
                    state.images.insert(spec.image.clone());
                    state.next_container += 1;
                    let id = ContainerId::new(format!(
                        "memory://{}-{}-{}",
                        pod.uid, spec.name, state.next_container
                    ));
                    containers.push(RunningContainer {
                        id: id.clone(),
                        name: spec.name.clone(),
                        image: spec.image.clone(),
                    });
                    statuses.push(ContainerStatus {
                        name: spec.name.clone(),
                        container_id: Some(id),
                        state: ContainerState::Running {
                            started_at: Some(Utc::now()),
                        },
                        last_termination: None,
                        ready: false,
                        restart_count: 0,
                        image: spec.image.clone(),
                    });
                }
            }
        }

        entry.running.name.clone_from(&pod.name);
        entry.running.namespace.clone_from(&pod.namespace);
        entry.running.containers = containers;
        entry.statuses = statuses;
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn version(&self) -> Result<RuntimeVersion> {
        let mut guard = self.state.lock();
        guard.stats.version_calls += 1;
        if guard.faults.down {
            return Err(RuntimeError::Unavailable("memory runtime marked down".to_string()));
        }
        Ok(RuntimeVersion {
            kind: RuntimeKind::Memory,
            version: VERSION.to_string(),
        })
    }

    async fn get_pods(&self, _use_cache: bool) -> Result<Vec<RunningPod>> {
        let guard = self.state.lock();
        if let Some(msg) = &guard.faults.list {
            return Err(RuntimeError::Other(msg.clone()));
        }
        let mut pods: Vec<RunningPod> = guard.pods.values().map(|p| p.running.clone()).collect();
        pods.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(pods)
    }

    async fn sync_pod(
        &self,
        pod: &Pod,
        _running: &RunningPod,
        _status: &PodStatus,
        pull_secrets: &[Secret],
    ) -> Result<()> {
        let delay = self.begin_sync(&pod.uid)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.apply_sync(pod);
        debug!(
            pod = %pod.full_name(),
            secrets = pull_secrets.len(),
            "Synced pod in memory runtime"
        );
        Ok(())
    }

    async fn kill_pod(&self, running: &RunningPod) -> Result<()> {
        let mut guard = self.state.lock();
        guard.stats.killed.push(running.id.clone());
        if guard.faults.kill.contains(&running.id) {
            return Err(RuntimeError::Other(format!(
                "injected kill failure for {}",
                running.id
            )));
        }
        if let Some(pod) = guard.pods.remove(&running.id) {
            for container in &pod.running.containers {
                guard.logs.remove(&container.id);
            }
        }
        Ok(())
    }

    async fn get_pod_status(&self, pod: &Pod) -> Result<PodStatus> {
        let guard = self.state.lock();
        if let Some(fault) = &guard.faults.status {
            return Err(fault.to_error());
        }

        let known = guard.pods.get(&pod.uid);
        let container_statuses = pod
            .spec
            .containers
            .iter()
            .map(|spec| {
                known
                    .and_then(|p| p.statuses.iter().find(|s| s.name == spec.name))
                    .cloned()
                    .unwrap_or_else(|| ContainerStatus {
                        name: spec.name.clone(),
                        container_id: None,
                        state: ContainerState::Waiting {
                            reason: Some("ContainerCreating".to_string()),
                        },
                        last_termination: None,
                        ready: false,
                        restart_count: 0,
                        image: spec.image.clone(),
                    })
            })
            .collect();

        Ok(PodStatus {
            container_statuses,
            ..Default::default()
        })
    }

    async fn get_container_logs(
        &self,
        pod: &Pod,
        container_id: &ContainerId,
        opts: &LogOptions,
    ) -> Result<String> {
        let guard = self.state.lock();
        let known = guard.pods.get(&pod.uid).is_some_and(|p| {
            p.statuses.iter().any(|s| {
                s.container_id.as_ref() == Some(container_id)
                    || s
                        .last_termination
                        .as_ref()
                        .and_then(|t| t.container_id.as_ref())
                        == Some(container_id)
            })
        });
        if !known && !guard.logs.contains_key(container_id) {
            return Err(RuntimeError::ContainerNotFound(container_id.clone()));
        }

        let lines = guard.logs.get(container_id).map_or(&[][..], Vec::as_slice);
        let start = opts
            .tail_lines
            .map_or(0, |tail| lines.len().saturating_sub(tail));
        let mut out = String::new();
        for line in &lines[start..] {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    async fn garbage_collect(&self, target: GcTarget) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(msg) = &state.faults.gc {
            return Err(RuntimeError::Other(msg.clone()));
        }

        match target {
            GcTarget::Containers => {
                let live: HashSet<&ContainerId> = state
                    .pods
                    .values()
                    .flat_map(|p| &p.statuses)
                    .flat_map(|s| {
                        let previous = s
                            .last_termination
                            .as_ref()
                            .and_then(|t| t.container_id.as_ref());
                        s.container_id.as_ref().into_iter().chain(previous)
                    })
                    .collect();
                state.logs.retain(|id, _| live.contains(id));
            }
            GcTarget::Images => {
                let used: HashSet<&str> = state
                    .pods
                    .values()
                    .flat_map(|p| &p.running.containers)
                    .map(|c| c.image.as_str())
                    .collect();
                state.images.retain(|image| used.contains(image.as_str()));
            }
        }
        *state.stats.gc_runs.entry(target).or_default() += 1;
        debug!(gc = %target, "Garbage collected memory runtime");
        Ok(())
    }
}
