//! The top-level reconciliation pass.
//!
//! [`NodeAgent::sync_pods`] admits the desired pods, hands each one to its
//! worker, kills whatever is running but no longer wanted and cleans up
//! volumes, directories and mirror pods left behind.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use nodelet_core::{ContainerId, Pod, PodPhase, PodUid};
use nodelet_runtime::{ContainerRuntime, LogOptions, RunningPod, RuntimeVersion};
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionPipeline;
use crate::error::AggregateError;
use crate::reconcile::PodReconciler;
use crate::sources::SourcesReady;
use crate::state::AgentState;
use crate::update::{SyncPodType, SyncTypes};
use crate::workers::{OnComplete, PodWorkers};
use crate::{AgentError, Result};

/// The node agent: owns the workers and runs reconciliation passes.
pub struct NodeAgent {
    state: AgentState,
    admission: AdmissionPipeline,
    workers: PodWorkers,
    sources_ready: Arc<SourcesReady>,
}

impl NodeAgent {
    /// Create an agent over shared state.
    ///
    /// Cleanup is skipped until every source in `sources_ready` has
    /// delivered its first update.
    #[must_use]
    pub fn new(state: AgentState, sources_ready: Arc<SourcesReady>) -> Self {
        let reconciler = Arc::new(PodReconciler::new(state.clone()));
        let workers = PodWorkers::new(reconciler, state.runtime.clone(), state.recorder.clone());
        let admission = AdmissionPipeline::new(
            state.status_manager.clone(),
            state.recorder.clone(),
            state.node_cache.clone(),
            state.machine_info.clone(),
            state.disk.clone(),
            state.config.max_pods,
        );
        Self {
            state,
            admission,
            workers,
            sources_ready,
        }
    }

    /// Shared agent state.
    #[must_use]
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Which sources have reported.
    #[must_use]
    pub fn sources_ready(&self) -> &SourcesReady {
        &self.sources_ready
    }

    /// Run one reconciliation pass over the full desired pod set.
    ///
    /// Rejected pods stay in `all_pods` so their directories survive.
    ///
    /// # Errors
    ///
    /// Returns the failures of the kill and cleanup stages, aggregated. A
    /// failure in one stage does not stop the others.
    pub async fn sync_pods(
        &self,
        all_pods: &[Pod],
        sync_types: &SyncTypes,
        mirrors: &HashMap<String, Pod>,
        start: Instant,
    ) -> Result<()> {
        let state = &self.state;
        let all_full_names: HashSet<String> = all_pods.iter().map(Pod::full_name).collect();
        state.status_manager.remove_orphaned_statuses(&all_full_names);

        let admitted = self.admission.admit(all_pods, sync_types).await;
        let desired: HashSet<PodUid> = admitted.iter().map(|p| p.uid.clone()).collect();

        for pod in &admitted {
            let mirror = mirrors.get(&pod.full_name()).cloned();
            let sync_type = sync_types.get(&pod.uid).copied().unwrap_or_default();
            let on_complete: Option<OnComplete> = (sync_type == SyncPodType::Create).then(|| {
                let name = pod.full_name();
                Box::new(move || {
                    debug!(
                        pod = %name,
                        elapsed_ms = start.elapsed().as_millis(),
                        "Pod started"
                    );
                }) as OnComplete
            });
            self.workers
                .update(pod.clone(), mirror, sync_type, on_complete);
        }

        self.workers.forget_unlisted(&desired);

        if !self.sources_ready.all_ready() {
            info!("Skipping deletes, sources aren't ready yet");
            return Ok(());
        }

        let mut errors = AggregateError::new();

        match state.runtime.get_pods(true).await {
            Ok(running) => {
                if let Err(e) = self.kill_unwanted_pods(&desired, &running).await {
                    error!(error = %e, "Failed killing unwanted pods");
                    errors.push(e);
                }
            }
            Err(e) => {
                error!(error = %e, "Error listing running pods");
                errors.push(e);
            }
        }

        // A kill may not be reflected in the cached view yet.
        let running = state.runtime.get_pods(false).await.map_err(|e| {
            error!(error = %e, "Failed to get running pods");
            AgentError::from(e)
        })?;
        let running_uids: HashSet<PodUid> = running.iter().map(|p| p.id.clone()).collect();

        if let Err(e) = self.cleanup_orphaned_volumes(&admitted, &running_uids).await {
            error!(error = %e, "Failed cleaning up orphaned volumes");
            errors.push(e);
        }
        if let Err(e) = self.cleanup_orphaned_pod_dirs(all_pods, &running_uids).await {
            error!(error = %e, "Failed cleaning up orphaned pod directories");
            errors.push(e);
        }
        if let Err(e) = state.pod_manager.delete_orphaned_mirror_pods().await {
            error!(error = %e, "Failed deleting orphaned mirror pods");
            errors.push(e);
        }

        debug!(
            pods = all_pods.len(),
            admitted = admitted.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Sync pass complete"
        );
        errors.into_result()
    }

    async fn kill_unwanted_pods(
        &self,
        desired: &HashSet<PodUid>,
        running: &[RunningPod],
    ) -> Result<()> {
        let runtime = &*self.state.runtime;
        let kills = running
            .iter()
            .filter(|p| !desired.contains(&p.id))
            .map(|p| async move {
                info!(pod = %p.full_name(), uid = %p.id, "Killing unwanted pod");
                runtime.kill_pod(p).await.map_err(|e| {
                    error!(pod = %p.full_name(), error = %e, "Failed killing pod");
                    AgentError::from(e)
                })
            });

        join_all(kills)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect::<AggregateError>()
            .into_result()
    }

    async fn cleanup_orphaned_volumes(
        &self,
        admitted: &[Pod],
        running: &HashSet<PodUid>,
    ) -> Result<()> {
        let desired: HashSet<(PodUid, String)> = admitted
            .iter()
            .filter(|p| {
                !self
                    .state
                    .status_manager
                    .get_pod_status(&p.full_name())
                    .is_some_and(|s| s.is_terminated())
            })
            .flat_map(|p| {
                p.spec
                    .volumes
                    .iter()
                    .map(|v| (p.uid.clone(), v.name.clone()))
            })
            .collect();
        self.state
            .volume_mounter
            .cleanup_orphaned_volumes(&desired, running, &self.state.volume_manager)
            .await
    }

    async fn cleanup_orphaned_pod_dirs(
        &self,
        all_pods: &[Pod],
        running: &HashSet<PodUid>,
    ) -> Result<()> {
        let keep: HashSet<&PodUid> = all_pods.iter().map(|p| &p.uid).collect();
        let mut errors = AggregateError::new();
        for uid in self.state.dirs.list_pod_uids_on_disk().await? {
            if keep.contains(&uid) || running.contains(&uid) {
                continue;
            }
            info!(uid = %uid, "Removing orphaned pod directory");
            match self.state.dirs.remove_pod_dir(&uid).await {
                Ok(()) => self.state.volume_manager.delete_volumes(&uid),
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Failed removing orphaned pod directory");
                    errors.push(e);
                }
            }
        }
        errors.into_result()
    }

    /// Desired pods, mirrors excluded.
    #[must_use]
    pub fn pods(&self) -> Vec<Pod> {
        self.state.pod_manager.pods()
    }

    /// Look up a desired pod by full name.
    #[must_use]
    pub fn pod_by_full_name(&self, full_name: &str) -> Option<Pod> {
        self.state.pod_manager.pod_by_full_name(full_name)
    }

    /// Look up a desired pod by namespace and name.
    #[must_use]
    pub fn pod_by_name(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state.pod_manager.pod_by_name(namespace, name)
    }

    /// Version of the active container runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime does not answer.
    pub async fn runtime_version(&self) -> Result<RuntimeVersion> {
        Ok(self.state.runtime.version().await?)
    }

    /// Name this node registers under.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.state.config.hostname
    }

    /// IP the node is reached at.
    ///
    /// # Errors
    ///
    /// Returns an error if the node record or its addresses are unknown.
    pub fn host_ip(&self) -> Result<IpAddr> {
        self.state.node_cache.host_ip()
    }

    /// Fetch the logs of a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod has no status yet, has not started, or
    /// the container (or its previous instance, with `previous`) is unknown.
    pub async fn container_logs(
        &self,
        full_name: &str,
        container: &str,
        opts: &LogOptions,
    ) -> Result<String> {
        let status = self
            .state
            .status_manager
            .get_pod_status(full_name)
            .ok_or_else(|| {
                warn!(pod = %full_name, "failed to get status for pod");
                AgentError::PodNotFound(full_name.to_string())
            })?;

        if !matches!(
            status.phase,
            PodPhase::Running | PodPhase::Succeeded | PodPhase::Failed
        ) {
            return Err(AgentError::InvalidRequest(format!(
                "pod {full_name:?} is not in 'Running', 'Succeeded' or 'Failed' state - State: {:?}",
                status.phase.as_str()
            )));
        }

        let cs = status
            .container_status(container)
            .ok_or_else(|| AgentError::ContainerNotFound {
                pod: full_name.to_string(),
                container: container.to_string(),
            })?;
        let container_id: ContainerId = if opts.previous {
            cs.last_termination
                .as_ref()
                .and_then(|t| t.container_id.clone())
                .ok_or_else(|| {
                    AgentError::InvalidRequest(format!(
                        "previous terminated container {container:?} not found in pod"
                    ))
                })?
        } else {
            if cs.state.is_waiting() {
                return Err(AgentError::InvalidRequest(format!(
                    "container {container:?} is in waiting state"
                )));
            }
            cs.container_id.clone().ok_or_else(|| AgentError::ContainerNotFound {
                pod: full_name.to_string(),
                container: container.to_string(),
            })?
        };

        let pod = self
            .pod_by_full_name(full_name)
            .ok_or_else(|| AgentError::PodNotFound(full_name.to_string()))?;
        Ok(self
            .state
            .runtime
            .get_container_logs(&pod, &container_id, opts)
            .await?)
    }
}
