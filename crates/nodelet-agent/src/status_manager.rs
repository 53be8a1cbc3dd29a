//! Pod status cache with upstream sync.
//!
//! Statuses are cached by pod full name. Setting a status that differs from
//! the cached one queues it for publication to the control plane; setting an
//! identical status is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use nodelet_core::{Pod, PodStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlane;

struct StatusUpdate {
    pod: Pod,
    status: PodStatus,
}

/// Caches synthesized pod statuses and publishes changes upstream.
pub struct StatusManager {
    statuses: RwLock<HashMap<String, PodStatus>>,
    tx: mpsc::UnboundedSender<StatusUpdate>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<StatusUpdate>>>,
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusManager {
    /// Create an empty status manager.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            statuses: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Start publishing queued statuses to the control plane.
    ///
    /// Returns `None` if publishing was already started.
    pub fn start(&self, control_plane: Arc<dyn ControlPlane>) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        info!("Starting pod status sync");
        Some(tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let name = update.pod.full_name();
                match control_plane
                    .update_pod_status(&update.pod, &update.status)
                    .await
                {
                    Ok(()) => debug!(
                        pod = %name,
                        phase = update.status.phase.as_str(),
                        "Published pod status"
                    ),
                    Err(e) => warn!(pod = %name, error = %e, "Error updating status for pod"),
                }
            }
        }))
    }

    /// Cache a status for a pod, queueing it upstream if it changed.
    ///
    /// The start time of the first cached status is kept across updates. A
    /// status without a start time takes the pod's recorded start time, or now.
    pub fn set_pod_status(&self, pod: &Pod, mut status: PodStatus) {
        let full_name = pod.full_name();
        let mut statuses = self.statuses.write();
        let old = statuses.get(&full_name);

        if let Some(start) = old.and_then(|s| s.start_time) {
            status.start_time = Some(start);
        }
        if status.start_time.is_none() {
            status.start_time = Some(pod.status.start_time.unwrap_or_else(Utc::now));
        }

        if old == Some(&status) {
            debug!(pod = %full_name, "Ignoring same pod status");
            return;
        }

        statuses.insert(full_name, status.clone());
        // Send fails only once the sync task has exited.
        if self
            .tx
            .send(StatusUpdate {
                pod: pod.clone(),
                status,
            })
            .is_err()
        {
            warn!(pod = %pod.full_name(), "Pod status sync is not running");
        }
    }

    /// Return the cached status of a pod.
    #[must_use]
    pub fn get_pod_status(&self, full_name: &str) -> Option<PodStatus> {
        self.statuses.read().get(full_name).cloned()
    }

    /// Drop the cached status of a pod, so the next status is published.
    pub fn delete_pod_status(&self, full_name: &str) {
        self.statuses.write().remove(full_name);
    }

    /// Drop every cached status not named in `keep`.
    pub fn remove_orphaned_statuses(&self, keep: &HashSet<String>) {
        self.statuses.write().retain(|name, _| keep.contains(name));
    }

    /// Number of cached statuses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    /// Return true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::mock::MockControlPlane;
    use chrono::{Duration as ChronoDuration, Utc};
    use nodelet_core::{PodPhase, PodSpec, PodUid};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn pod(name: &str) -> Pod {
        Pod {
            uid: PodUid::new(name).unwrap(),
            namespace: "default".to_string(),
            name: name.to_string(),
            creation_timestamp: Utc::now(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }

    #[test]
    fn start_time_is_kept_across_updates() {
        let manager = StatusManager::new();
        let p = pod("a");

        manager.set_pod_status(&p, PodStatus::pending("first"));
        let first = manager.get_pod_status("a_default").unwrap().start_time;
        assert!(first.is_some());

        let mut next = PodStatus::pending("second");
        next.start_time = Some(Utc::now() + ChronoDuration::hours(1));
        manager.set_pod_status(&p, next);
        assert_eq!(manager.get_pod_status("a_default").unwrap().start_time, first);
    }

    #[test]
    fn start_time_comes_from_recorded_pod_status() {
        let manager = StatusManager::new();
        let mut p = pod("a");
        let recorded = Utc::now() - ChronoDuration::hours(2);
        p.status.start_time = Some(recorded);

        manager.set_pod_status(&p, PodStatus::pending("restarted"));
        assert_eq!(
            manager.get_pod_status("a_default").unwrap().start_time,
            Some(recorded)
        );
    }

    #[test]
    fn orphaned_statuses_are_removed() {
        let manager = StatusManager::new();
        manager.set_pod_status(&pod("a"), PodStatus::pending("a"));
        manager.set_pod_status(&pod("b"), PodStatus::pending("b"));

        let keep: HashSet<String> = ["a_default".to_string()].into_iter().collect();
        manager.remove_orphaned_statuses(&keep);
        assert_eq!(manager.len(), 1);
        assert!(manager.get_pod_status("b_default").is_none());

        manager.delete_pod_status("a_default");
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn only_changed_statuses_are_published() {
        let manager = StatusManager::new();
        let cp = Arc::new(MockControlPlane::new());
        let handle = manager.start(cp.clone()).unwrap();
        assert!(manager.start(cp.clone()).is_none());

        let p = pod("a");
        let mut status = PodStatus::pending("waiting");
        status.start_time = Some(Utc::now());
        manager.set_pod_status(&p, status.clone());
        manager.set_pod_status(&p, status.clone());
        status.phase = PodPhase::Running;
        manager.set_pod_status(&p, status);

        for _ in 0..100 {
            if cp.pod_status_updates() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cp.pod_status_updates(), 2);
        assert_eq!(cp.pod_status("a_default").unwrap().phase, PodPhase::Running);

        drop(manager);
        handle.await.unwrap();
    }
}
