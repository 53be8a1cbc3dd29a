//! Pod status synthesis.
//!
//! Turns raw container state reported by the runtime into a pod phase,
//! per-container readiness and a Ready condition.

use std::sync::Arc;

use chrono::Utc;
use nodelet_core::{
    ConditionStatus, ContainerState, ContainerStatus, Pod, PodCondition, PodConditionType,
    PodPhase, PodSpec, PodStatus, RestartPolicy,
};
use nodelet_runtime::ContainerRuntime;
use tracing::{info, warn};

use crate::events::{reasons, EventRecorder, EventType, ObjectRef};
use crate::node_cache::NodeCache;
use crate::readiness::ReadinessManager;
use crate::status_manager::StatusManager;
use crate::Result;

/// Message for pods that ran past their active deadline.
pub const DEADLINE_EXCEEDED_MESSAGE: &str =
    "Pod was active on the node longer than specified deadline";

/// Derive the pod phase from the statuses of the containers in `spec`.
///
/// A container without a status counts as unknown.
#[must_use]
pub fn get_phase(spec: &PodSpec, statuses: &[ContainerStatus]) -> PodPhase {
    let mut running = 0usize;
    let mut waiting = 0usize;
    let mut stopped = 0usize;
    let mut succeeded = 0usize;
    let mut unknown = 0usize;

    for container in &spec.containers {
        match statuses.iter().find(|s| s.name == container.name) {
            Some(status) => match &status.state {
                ContainerState::Running { .. } => running += 1,
                ContainerState::Waiting { .. } => waiting += 1,
                ContainerState::Terminated(term) => {
                    stopped += 1;
                    if term.exit_code == 0 {
                        succeeded += 1;
                    }
                }
            },
            None => unknown += 1,
        }
    }

    if waiting > 0 {
        return PodPhase::Pending;
    }
    if running > 0 && unknown == 0 {
        return PodPhase::Running;
    }
    if running == 0 && stopped > 0 && unknown == 0 {
        if spec.restart_policy == RestartPolicy::Always {
            return PodPhase::Running;
        }
        if stopped == succeeded {
            return PodPhase::Succeeded;
        }
        if spec.restart_policy == RestartPolicy::Never {
            return PodPhase::Failed;
        }
        // OnFailure with at least one failure restarts.
        return PodPhase::Running;
    }
    PodPhase::Pending
}

/// Build the Ready condition for a pod.
///
/// Ready only if every container in `spec` reports ready. No status
/// information means not ready.
#[must_use]
pub fn pod_ready_condition(spec: &PodSpec, statuses: Option<&[ContainerStatus]>) -> PodCondition {
    let ready = statuses.is_some_and(|statuses| {
        spec.containers.iter().all(|c| {
            statuses
                .iter()
                .find(|s| s.name == c.name)
                .is_some_and(|s| s.ready)
        })
    });
    PodCondition {
        condition_type: PodConditionType::Ready,
        status: ConditionStatus::from_bool(ready),
    }
}

/// Produces synthesized pod statuses.
pub struct StatusGenerator {
    runtime: Arc<dyn ContainerRuntime>,
    readiness: Arc<ReadinessManager>,
    status_manager: Arc<StatusManager>,
    node_cache: Arc<NodeCache>,
    recorder: Arc<dyn EventRecorder>,
}

impl StatusGenerator {
    /// Create a generator.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        readiness: Arc<ReadinessManager>,
        status_manager: Arc<StatusManager>,
        node_cache: Arc<NodeCache>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            runtime,
            readiness,
            status_manager,
            node_cache,
            recorder,
        }
    }

    /// Return true if the pod has been active longer than its deadline.
    ///
    /// The start time comes from the cached status, or the pod's recorded
    /// status when nothing is cached.
    #[must_use]
    pub fn past_active_deadline(&self, pod: &Pod) -> bool {
        let Some(deadline) = pod.spec.active_deadline_seconds else {
            return false;
        };
        let start = self
            .status_manager
            .get_pod_status(&pod.full_name())
            .map_or(pod.status.start_time, |s| s.start_time);
        start.is_some_and(|start| (Utc::now() - start).num_seconds() >= deadline)
    }

    /// Synthesize the status of a pod.
    ///
    /// # Errors
    ///
    /// Returns the runtime error when the runtime reports a transient
    /// failure. Other runtime failures yield a `Pending` status carrying the
    /// error text.
    pub async fn generate_pod_status(&self, pod: &Pod) -> Result<PodStatus> {
        let full_name = pod.full_name();

        if self.past_active_deadline(pod) {
            self.recorder.event(
                &ObjectRef::pod(pod),
                EventType::Normal,
                reasons::DEADLINE,
                DEADLINE_EXCEEDED_MESSAGE,
            );
            return Ok(PodStatus::failed(DEADLINE_EXCEEDED_MESSAGE));
        }

        let mut status = match self.runtime.get_pod_status(pod).await {
            Ok(status) => status,
            Err(e) if e.is_transient() => {
                info!(pod = %full_name, error = %e, "Query container info failed");
                return Err(e.into());
            }
            Err(e) => {
                info!(pod = %full_name, error = %e, "Query container info failed");
                return Ok(PodStatus::pending(format!(
                    "Query container info failed with error ({e})"
                )));
            }
        };

        status.phase = get_phase(&pod.spec, &status.container_statuses);
        for cs in &mut status.container_statuses {
            cs.ready = cs.state.is_running()
                && cs
                    .container_id
                    .as_ref()
                    .is_some_and(|id| self.readiness.is_ready(id));
        }
        status
            .conditions
            .push(pod_ready_condition(&pod.spec, Some(&status.container_statuses)));

        match self.node_cache.host_ip() {
            Ok(ip) => status.host_ip = Some(ip),
            Err(e) => warn!(pod = %full_name, error = %e, "Cannot get host IP"),
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mock::RecordingEventRecorder;
    use chrono::Duration as ChronoDuration;
    use nodelet_core::{Container, ContainerId, PodUid, Termination};
    use nodelet_runtime::memory::Fault;
    use nodelet_runtime::{MemoryRuntime, RunningPod};
    use std::collections::BTreeMap;

    fn spec(names: &[&str], policy: RestartPolicy) -> PodSpec {
        PodSpec {
            containers: names
                .iter()
                .map(|n| Container {
                    name: (*n).to_string(),
                    image: "busybox".to_string(),
                    ..Default::default()
                })
                .collect(),
            restart_policy: policy,
            ..Default::default()
        }
    }

    fn status(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            container_id: Some(ContainerId::new(format!("memory://{name}"))),
            state,
            last_termination: None,
            ready: false,
            restart_count: 0,
            image: "busybox".to_string(),
        }
    }

    const POLICIES: [RestartPolicy; 3] = [
        RestartPolicy::Always,
        RestartPolicy::OnFailure,
        RestartPolicy::Never,
    ];

    #[test]
    fn waiting_container_means_pending() {
        for policy in POLICIES {
            let statuses = [
                status("a", ContainerState::running()),
                status("b", ContainerState::waiting()),
            ];
            assert_eq!(get_phase(&spec(&["a", "b"], policy), &statuses), PodPhase::Pending);
        }
    }

    #[test]
    fn running_containers_mean_running() {
        let statuses = [
            status("a", ContainerState::running()),
            status("b", ContainerState::terminated(1)),
        ];
        assert_eq!(
            get_phase(&spec(&["a", "b"], RestartPolicy::Never), &statuses),
            PodPhase::Running
        );
    }

    #[test]
    fn all_succeeded_means_succeeded_unless_always() {
        let statuses = [
            status("a", ContainerState::terminated(0)),
            status("b", ContainerState::terminated(0)),
        ];
        assert_eq!(
            get_phase(&spec(&["a", "b"], RestartPolicy::OnFailure), &statuses),
            PodPhase::Succeeded
        );
        assert_eq!(
            get_phase(&spec(&["a", "b"], RestartPolicy::Never), &statuses),
            PodPhase::Succeeded
        );
        assert_eq!(
            get_phase(&spec(&["a", "b"], RestartPolicy::Always), &statuses),
            PodPhase::Running
        );
    }

    #[test]
    fn failure_phase_depends_on_policy() {
        let statuses = [
            status("a", ContainerState::terminated(0)),
            status("b", ContainerState::terminated(1)),
        ];
        assert_eq!(
            get_phase(&spec(&["a", "b"], RestartPolicy::Never), &statuses),
            PodPhase::Failed
        );
        assert_eq!(
            get_phase(&spec(&["a", "b"], RestartPolicy::OnFailure), &statuses),
            PodPhase::Running
        );

        let single = [status("a", ContainerState::terminated(1))];
        assert_eq!(
            get_phase(&spec(&["a"], RestartPolicy::Always), &single),
            PodPhase::Running
        );
    }

    #[test]
    fn missing_statuses_mean_pending() {
        for policy in POLICIES {
            assert_eq!(get_phase(&spec(&["a"], policy), &[]), PodPhase::Pending);
            let partial = [status("a", ContainerState::running())];
            assert_eq!(
                get_phase(&spec(&["a", "b"], policy), &partial),
                PodPhase::Pending
            );
        }
    }

    #[test]
    fn phase_is_deterministic() {
        let states = [
            ContainerState::running(),
            ContainerState::waiting(),
            ContainerState::terminated(0),
            ContainerState::terminated(2),
        ];
        for policy in POLICIES {
            for a in &states {
                for b in &states {
                    let statuses = [status("a", a.clone()), status("b", b.clone())];
                    let s = spec(&["a", "b"], policy);
                    assert_eq!(get_phase(&s, &statuses), get_phase(&s, &statuses));
                }
            }
        }
    }

    #[test]
    fn ready_condition() {
        let s = spec(&["a", "b"], RestartPolicy::Always);
        assert_eq!(pod_ready_condition(&s, None).status, ConditionStatus::False);

        let mut statuses = vec![
            status("a", ContainerState::running()),
            status("b", ContainerState::running()),
        ];
        assert_eq!(
            pod_ready_condition(&s, Some(&statuses)).status,
            ConditionStatus::False
        );

        statuses[0].ready = true;
        statuses[1].ready = true;
        assert_eq!(
            pod_ready_condition(&s, Some(&statuses)).status,
            ConditionStatus::True
        );

        statuses.pop();
        assert_eq!(
            pod_ready_condition(&s, Some(&statuses)).status,
            ConditionStatus::False
        );
    }

    struct Fixture {
        runtime: Arc<MemoryRuntime>,
        readiness: Arc<ReadinessManager>,
        status_manager: Arc<StatusManager>,
        recorder: Arc<RecordingEventRecorder>,
        generator: StatusGenerator,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(MemoryRuntime::new());
        let readiness = Arc::new(ReadinessManager::new());
        let status_manager = Arc::new(StatusManager::new());
        let recorder = Arc::new(RecordingEventRecorder::new());
        let generator = StatusGenerator::new(
            runtime.clone(),
            readiness.clone(),
            status_manager.clone(),
            Arc::new(NodeCache::new()),
            recorder.clone(),
        );
        Fixture {
            runtime,
            readiness,
            status_manager,
            recorder,
            generator,
        }
    }

    fn pod(policy: RestartPolicy) -> Pod {
        Pod {
            uid: PodUid::new("uid-1").unwrap(),
            namespace: "default".to_string(),
            name: "web".to_string(),
            creation_timestamp: Utc::now(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: spec(&["app"], policy),
            status: PodStatus::default(),
        }
    }

    #[tokio::test]
    async fn generated_status_uses_readiness_results() {
        let f = fixture();
        let p = pod(RestartPolicy::Always);
        f.runtime
            .sync_pod(&p, &RunningPod::empty(&p), &PodStatus::default(), &[])
            .await
            .unwrap();

        let status = f.generator.generate_pod_status(&p).await.unwrap();
        assert_eq!(status.phase, PodPhase::Running);
        assert!(!status.container_statuses[0].ready);
        assert_eq!(
            status.ready_condition().unwrap().status,
            ConditionStatus::False
        );

        let id = f.runtime.container_id(&p.uid, "app").unwrap();
        f.readiness.set_readiness(&id, true);
        let status = f.generator.generate_pod_status(&p).await.unwrap();
        assert!(status.container_statuses[0].ready);
        assert_eq!(status.ready_condition().unwrap().status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn terminated_container_is_never_ready() {
        let f = fixture();
        let p = pod(RestartPolicy::Never);
        f.runtime
            .sync_pod(&p, &RunningPod::empty(&p), &PodStatus::default(), &[])
            .await
            .unwrap();
        let id = f.runtime.container_id(&p.uid, "app").unwrap();
        f.readiness.set_readiness(&id, true);
        f.runtime.set_container_state(
            &p.uid,
            "app",
            ContainerState::Terminated(Termination {
                exit_code: 0,
                ..Default::default()
            }),
        );

        let status = f.generator.generate_pod_status(&p).await.unwrap();
        assert_eq!(status.phase, PodPhase::Succeeded);
        assert!(!status.container_statuses[0].ready);
    }

    #[tokio::test]
    async fn deadline_forces_failed_without_runtime_query() {
        let f = fixture();
        let mut p = pod(RestartPolicy::Always);
        p.spec.active_deadline_seconds = Some(30);
        p.status.start_time = Some(Utc::now() - ChronoDuration::seconds(60));
        f.runtime.fail_status(Some(Fault::TemporarilyUnavailable));

        let status = f.generator.generate_pod_status(&p).await.unwrap();
        assert_eq!(status.phase, PodPhase::Failed);
        assert_eq!(status.message.as_deref(), Some(DEADLINE_EXCEEDED_MESSAGE));
        assert_eq!(f.recorder.count(reasons::DEADLINE), 1);
    }

    #[tokio::test]
    async fn deadline_prefers_cached_start_time() {
        let f = fixture();
        let mut p = pod(RestartPolicy::Always);
        p.spec.active_deadline_seconds = Some(30);
        p.status.start_time = Some(Utc::now() - ChronoDuration::seconds(60));

        let mut cached = PodStatus::pending("cached");
        cached.start_time = Some(Utc::now());
        f.status_manager.set_pod_status(&p, cached);

        assert!(!f.generator.past_active_deadline(&p));
    }

    #[tokio::test]
    async fn runtime_failures_split_by_class() {
        let f = fixture();
        let p = pod(RestartPolicy::Always);

        f.runtime.fail_status(Some(Fault::TemporarilyUnavailable));
        let err = f.generator.generate_pod_status(&p).await.unwrap_err();
        assert!(err.is_transient_runtime());

        f.runtime.fail_status(Some(Fault::Other("inspect failed".into())));
        let status = f.generator.generate_pod_status(&p).await.unwrap();
        assert_eq!(status.phase, PodPhase::Pending);
        assert_eq!(
            status.message.as_deref(),
            Some("Query container info failed with error (inspect failed)")
        );
    }
}
