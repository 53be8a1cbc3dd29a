//! Reconciliation of a single pod.

use async_trait::async_trait;
use nodelet_core::{Pod, Secret};
use nodelet_runtime::{ContainerRuntime, RunningPod};
use tracing::{debug, error, warn};

use crate::events::{reasons, EventType, ObjectRef};
use crate::state::AgentState;
use crate::status::StatusGenerator;
use crate::update::SyncPodType;
use crate::workers::PodSyncer;
use crate::{AgentError, Result};

/// Brings one pod's containers, directories, volumes and mirror in line with
/// its spec.
pub struct PodReconciler {
    state: AgentState,
    generator: StatusGenerator,
}

impl PodReconciler {
    /// Create a reconciler over shared agent state.
    #[must_use]
    pub fn new(state: AgentState) -> Self {
        let generator = state.status_generator();
        Self { state, generator }
    }

    /// Check whether the node allows this pod to run at all.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::CannotRun`] naming the disallowed feature.
    pub fn can_run_pod(&self, pod: &Pod) -> Result<()> {
        let config = &self.state.config;
        if pod.spec.has_privileged_container() && !config.allow_privileged {
            return Err(AgentError::CannotRun(format!(
                "pod with UID {:?} specified privileged container, but is disallowed",
                pod.uid.as_str()
            )));
        }
        if pod.spec.host_network {
            let allowed = pod
                .source()
                .is_some_and(|s| config.host_network_sources.iter().any(|a| a == s));
            if !allowed {
                return Err(AgentError::CannotRun(format!(
                    "pod with UID {:?} specified host networking, but is disallowed",
                    pod.uid.as_str()
                )));
            }
        }
        Ok(())
    }

    async fn pull_secrets(&self, pod: &Pod) -> Result<Vec<Secret>> {
        let mut secrets = Vec::with_capacity(pod.spec.image_pull_secrets.len());
        for name in &pod.spec.image_pull_secrets {
            let secret = self
                .state
                .control_plane
                .get_secret(&pod.namespace, name)
                .await
                .map_err(|e| {
                    AgentError::ControlPlane(format!(
                        "unable to retrieve pull secret {}/{name} for {}: {e}",
                        pod.namespace,
                        pod.full_name()
                    ))
                })?;
            secrets.push(secret);
        }
        Ok(secrets)
    }

    async fn sync(&self, pod: &Pod, mirror: Option<&Pod>, running: &RunningPod) -> Result<()> {
        let full_name = pod.full_name();
        let state = &self.state;

        if let Err(e) = self.can_run_pod(pod) {
            if !running.is_empty() {
                if let Err(kill_err) = state.runtime.kill_pod(running).await {
                    error!(pod = %full_name, error = %kill_err, "Failed killing pod that cannot run");
                }
            }
            return Err(e);
        }

        state
            .dirs
            .make_pod_data_dirs(&pod.uid)
            .await
            .inspect_err(|e| {
                error!(pod = %full_name, error = %e, "Unable to make pod data directories");
            })?;

        let volumes = match state.volume_mounter.mount_external_volumes(pod).await {
            Ok(volumes) => volumes,
            Err(e) => {
                state.recorder.event(
                    &ObjectRef::pod(pod),
                    EventType::Warning,
                    reasons::FAILED_MOUNT,
                    &format!("Unable to mount volumes for pod {full_name:?}: {e}"),
                );
                return Err(e);
            }
        };
        state.volume_manager.set_volumes(&pod.uid, volumes);

        let status = self.generator.generate_pod_status(pod).await?;
        let secrets = self.pull_secrets(pod).await?;

        state
            .runtime
            .sync_pod(pod, running, &status, &secrets)
            .await?;

        match state.runtime.get_pod_status(pod).await {
            Ok(raw) => state.readiness.probe_pod(pod, &raw),
            Err(e) => debug!(pod = %full_name, error = %e, "Skipping readiness update"),
        }

        if pod.is_static() {
            self.reconcile_mirror(pod, mirror).await;
        }
        Ok(())
    }

    async fn reconcile_mirror(&self, pod: &Pod, mirror: Option<&Pod>) {
        let full_name = pod.full_name();
        let pods = &self.state.pod_manager;

        let mut missing = mirror.is_none();
        if let Some(mirror) = mirror {
            if !pods.is_mirror_pod_of(mirror, pod) {
                warn!(pod = %full_name, "Deleting mirror pod because it is outdated");
                match pods.delete_mirror_pod(&full_name).await {
                    Ok(()) => missing = true,
                    Err(e) => error!(pod = %full_name, error = %e, "Failed deleting mirror pod"),
                }
            }
        }
        if missing {
            debug!(pod = %full_name, "Creating mirror pod");
            if let Err(e) = pods.create_mirror_pod(pod).await {
                error!(pod = %full_name, error = %e, "Failed creating mirror pod");
            }
            // Status updates are edge-triggered; a new mirror needs a fresh one.
            self.state.status_manager.delete_pod_status(&full_name);
        }
    }

    async fn publish_status(&self, pod: &Pod, mirror: Option<&Pod>) {
        if pod.is_static() && mirror.is_none() {
            return;
        }
        match self.generator.generate_pod_status(pod).await {
            Ok(status) => self
                .state
                .status_manager
                .set_pod_status(mirror.unwrap_or(pod), status),
            Err(e) => error!(pod = %pod.full_name(), error = %e, "Unable to generate status for pod"),
        }
    }
}

#[async_trait]
impl PodSyncer for PodReconciler {
    async fn sync_pod(
        &self,
        pod: &Pod,
        mirror: Option<&Pod>,
        running: &RunningPod,
        sync_type: SyncPodType,
    ) -> Result<()> {
        debug!(pod = %pod.full_name(), sync_type = ?sync_type, "Syncing pod");
        let result = self.sync(pod, mirror, running).await;
        self.publish_status(pod, mirror).await;
        result
    }
}
