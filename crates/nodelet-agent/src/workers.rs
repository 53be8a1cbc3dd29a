//! Per-pod reconciliation workers.
//!
//! Each pod UID gets one worker task fed by a channel of capacity one. While
//! a sync is in flight, newer updates for the same UID overwrite a single
//! pending slot, so the worker always moves on to the latest spec and never
//! runs two syncs for one pod at once. Different pods sync in parallel.
//!
//! A worker dropped by [`PodWorkers::forget_unlisted`] while it is syncing
//! stays registered until that sync returns. An update for the same UID in
//! the meantime is queued behind it rather than starting a second worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nodelet_core::{Pod, PodUid};
use nodelet_runtime::{ContainerRuntime, RunningPod};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::events::{reasons, EventRecorder, EventType, ObjectRef};
use crate::update::SyncPodType;
use crate::Result;

/// Reconciles one pod against the runtime.
#[async_trait]
pub trait PodSyncer: Send + Sync {
    /// Make the runtime match `pod`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod could not be brought to its desired state.
    async fn sync_pod(
        &self,
        pod: &Pod,
        mirror: Option<&Pod>,
        running: &RunningPod,
        sync_type: SyncPodType,
    ) -> Result<()>;
}

/// Callback run after a successful sync.
pub type OnComplete = Box<dyn FnOnce() + Send>;

struct WorkUpdate {
    pod: Pod,
    mirror: Option<Pod>,
    sync_type: SyncPodType,
    on_complete: Option<OnComplete>,
}

struct WorkerRecord {
    tx: mpsc::Sender<WorkUpdate>,
    working: bool,
    pending: Option<WorkUpdate>,
    /// No longer desired; removed once the in-flight sync returns.
    forgotten: bool,
}

type Registry = Arc<Mutex<HashMap<PodUid, WorkerRecord>>>;

/// Dispatches pod updates to per-UID workers.
pub struct PodWorkers {
    workers: Registry,
    syncer: Arc<dyn PodSyncer>,
    runtime: Arc<dyn ContainerRuntime>,
    recorder: Arc<dyn EventRecorder>,
}

impl PodWorkers {
    /// Create an empty pool.
    ///
    /// `runtime` supplies each worker's view of what is running and may be a
    /// cached runtime.
    #[must_use]
    pub fn new(
        syncer: Arc<dyn PodSyncer>,
        runtime: Arc<dyn ContainerRuntime>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            syncer,
            runtime,
            recorder,
        }
    }

    /// Queue a sync of `pod`.
    ///
    /// If the pod's worker is idle the sync starts now; otherwise it replaces
    /// any sync already waiting and runs once the current one finishes.
    pub fn update(
        &self,
        pod: Pod,
        mirror: Option<Pod>,
        sync_type: SyncPodType,
        on_complete: Option<OnComplete>,
    ) {
        let uid = pod.uid.clone();
        let update = WorkUpdate {
            pod,
            mirror,
            sync_type,
            on_complete,
        };

        let mut workers = self.workers.lock();
        let record = workers.entry(uid.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(1);
            self.spawn_worker(uid.clone(), rx);
            WorkerRecord {
                tx,
                working: false,
                pending: None,
                forgotten: false,
            }
        });
        record.forgotten = false;

        if record.working {
            record.pending = Some(update);
            return;
        }
        record.working = true;
        // The worker is idle, so the single slot is free.
        if record.tx.try_send(update).is_err() {
            error!(uid = %uid, "Pod worker channel unexpectedly full");
            record.working = false;
        }
    }

    /// Drop workers for every UID not in `desired`.
    ///
    /// A sync in flight for a dropped UID runs to completion and any pending
    /// update is discarded. The record is removed once that sync returns.
    pub fn forget_unlisted(&self, desired: &HashSet<PodUid>) {
        self.workers.lock().retain(|uid, record| {
            if desired.contains(uid) {
                return true;
            }
            debug!(uid = %uid, working = record.working, "Forgetting pod worker");
            record.pending = None;
            record.forgotten = true;
            record.working
        });
    }

    /// Number of live worker records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Return true if no worker records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    fn spawn_worker(&self, uid: PodUid, mut rx: mpsc::Receiver<WorkUpdate>) {
        let workers = self.workers.clone();
        let syncer = self.syncer.clone();
        let runtime = self.runtime.clone();
        let recorder = self.recorder.clone();

        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                manage_update(&*syncer, &*runtime, &*recorder, update).await;
                wrap_up(&workers, &uid);
            }
            debug!(uid = %uid, "Pod worker stopped");
        });
    }
}

async fn manage_update(
    syncer: &dyn PodSyncer,
    runtime: &dyn ContainerRuntime,
    recorder: &dyn EventRecorder,
    update: WorkUpdate,
) {
    let pod = &update.pod;
    let start = Instant::now();

    let running = match runtime.get_pods(true).await {
        Ok(pods) => RunningPod::find(&pods, &pod.uid)
            .cloned()
            .unwrap_or_else(|| RunningPod::empty(pod)),
        Err(e) => {
            error!(pod = %pod.full_name(), error = %e, "Error getting pods while syncing pod");
            return;
        }
    };

    match syncer
        .sync_pod(pod, update.mirror.as_ref(), &running, update.sync_type)
        .await
    {
        Ok(()) => {
            debug!(
                pod = %pod.full_name(),
                sync_type = ?update.sync_type,
                elapsed_ms = start.elapsed().as_millis(),
                "Pod synced"
            );
            if let Some(done) = update.on_complete {
                done();
            }
        }
        Err(e) => {
            error!(pod = %pod.full_name(), error = %e, "Error syncing pod, skipping");
            recorder.event(
                &ObjectRef::pod(pod),
                EventType::Warning,
                reasons::FAILED_SYNC,
                &format!("Error syncing pod, skipping: {e}"),
            );
        }
    }
}

fn wrap_up(workers: &Mutex<HashMap<PodUid, WorkerRecord>>, uid: &PodUid) {
    let mut workers = workers.lock();
    let Some(record) = workers.get_mut(uid) else {
        return;
    };
    match record.pending.take() {
        Some(next) => {
            if record.tx.try_send(next).is_err() {
                error!(uid = %uid, "Pod worker channel unexpectedly full");
                record.working = false;
            }
        }
        None if record.forgotten => {
            // Dropping the sender stops the worker.
            workers.remove(uid);
        }
        None => record.working = false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mock::RecordingEventRecorder;
    use chrono::Utc;
    use nodelet_core::{Container, PodSpec, PodStatus};
    use nodelet_runtime::MemoryRuntime;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RuntimeSyncer {
        runtime: Arc<MemoryRuntime>,
    }

    #[async_trait]
    impl PodSyncer for RuntimeSyncer {
        async fn sync_pod(
            &self,
            pod: &Pod,
            _mirror: Option<&Pod>,
            running: &RunningPod,
            _sync_type: SyncPodType,
        ) -> Result<()> {
            self.runtime
                .sync_pod(pod, running, &PodStatus::default(), &[])
                .await?;
            Ok(())
        }
    }

    fn pod(uid: &str, image: &str) -> Pod {
        Pod {
            uid: PodUid::new(uid).unwrap(),
            namespace: "default".to_string(),
            name: uid.to_string(),
            creation_timestamp: Utc::now(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: image.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: PodStatus::default(),
        }
    }

    fn pool(runtime: &Arc<MemoryRuntime>) -> (PodWorkers, Arc<RecordingEventRecorder>) {
        let recorder = Arc::new(RecordingEventRecorder::new());
        let syncer = Arc::new(RuntimeSyncer {
            runtime: runtime.clone(),
        });
        (
            PodWorkers::new(syncer, runtime.clone(), recorder.clone()),
            recorder,
        )
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_updates_coalesce_to_latest() {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.set_sync_delay(Duration::from_millis(50));
        let (workers, _) = pool(&runtime);
        let uid = PodUid::new("a").unwrap();

        for i in 0..10 {
            workers.update(pod("a", &format!("img:v{i}")), None, SyncPodType::Update, None);
        }

        wait_for(|| {
            runtime
                .last_synced(&uid)
                .is_some_and(|p| p.spec.containers[0].image == "img:v9")
        })
        .await;
        assert_eq!(runtime.max_concurrent_syncs(&uid), 1);
        // First update plus the last pending one.
        assert_eq!(runtime.sync_count(&uid), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_pods_sync_in_parallel() {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.set_sync_delay(Duration::from_millis(100));
        let (workers, _) = pool(&runtime);

        let started = tokio::time::Instant::now();
        for uid in ["a", "b", "c"] {
            workers.update(pod(uid, "img"), None, SyncPodType::Create, None);
        }
        let uids: Vec<PodUid> = ["a", "b", "c"]
            .into_iter()
            .map(|u| PodUid::new(u).unwrap())
            .collect();
        wait_for(|| uids.iter().all(|u| runtime.last_synced(u).is_some())).await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(workers.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_runs_only_on_success() {
        let runtime = Arc::new(MemoryRuntime::new());
        let (workers, recorder) = pool(&runtime);
        let completed = Arc::new(AtomicUsize::new(0));

        let c = completed.clone();
        workers.update(
            pod("ok", "img"),
            None,
            SyncPodType::Create,
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let bad = PodUid::new("bad").unwrap();
        runtime.fail_sync(&bad, true);
        let c = completed.clone();
        workers.update(
            pod("bad", "img"),
            None,
            SyncPodType::Create,
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );

        wait_for(|| recorder.count(reasons::FAILED_SYNC) == 1).await;
        wait_for(|| completed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(runtime.sync_count(&bad), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_workers_are_recreated() {
        let runtime = Arc::new(MemoryRuntime::new());
        let (workers, _) = pool(&runtime);
        let a = PodUid::new("a").unwrap();

        workers.update(pod("a", "img:1"), None, SyncPodType::Create, None);
        workers.update(pod("b", "img:1"), None, SyncPodType::Create, None);
        wait_for(|| runtime.sync_count(&a) == 1).await;

        workers.forget_unlisted(&HashSet::from([PodUid::new("b").unwrap()]));
        assert_eq!(workers.len(), 1);

        workers.update(pod("a", "img:2"), None, SyncPodType::Update, None);
        assert_eq!(workers.len(), 2);
        wait_for(|| runtime.sync_count(&a) == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn readded_pod_waits_for_forgotten_sync() {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.set_sync_delay(Duration::from_millis(100));
        let (workers, _) = pool(&runtime);
        let a = PodUid::new("a").unwrap();

        workers.update(pod("a", "img:v1"), None, SyncPodType::Create, None);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Still syncing, so the record outlives the forget.
        workers.forget_unlisted(&HashSet::new());
        assert_eq!(workers.len(), 1);

        workers.update(pod("a", "img:v2"), None, SyncPodType::Create, None);
        assert_eq!(workers.len(), 1);

        wait_for(|| {
            runtime
                .last_synced(&a)
                .is_some_and(|p| p.spec.containers[0].image == "img:v2")
        })
        .await;
        assert_eq!(runtime.max_concurrent_syncs(&a), 1);
        assert_eq!(runtime.sync_count(&a), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_busy_worker_is_removed_after_sync() {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.set_sync_delay(Duration::from_millis(100));
        let (workers, _) = pool(&runtime);
        let a = PodUid::new("a").unwrap();

        workers.update(pod("a", "img:v1"), None, SyncPodType::Create, None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        workers.update(pod("a", "img:v2"), None, SyncPodType::Update, None);
        workers.forget_unlisted(&HashSet::new());

        wait_for(|| workers.is_empty()).await;
        // The pending update was discarded with the worker.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runtime.sync_count(&a), 1);
    }
}
