//! The agent's main loop.
//!
//! Waits for either a pod update or the resync tick. An update opens a short
//! drain window in which further updates are folded into the same pass, so a
//! burst of changes costs one reconciliation instead of many.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::sync::NodeAgent;
use crate::update::{PodUpdate, SyncTypes};

/// Drives [`NodeAgent::sync_pods`] from a stream of pod updates.
pub struct MainLoop {
    agent: Arc<NodeAgent>,
    resync_interval: Duration,
    drain_window: Duration,
}

impl MainLoop {
    /// Create a loop using the agent's configured intervals.
    #[must_use]
    pub fn new(agent: Arc<NodeAgent>) -> Self {
        let config = &agent.state().config;
        let resync_interval = config.resync_interval();
        let drain_window = config.drain_window();
        Self {
            agent,
            resync_interval,
            drain_window,
        }
    }

    /// Run until every sender of `updates` is dropped.
    pub async fn run(self, mut updates: mpsc::Receiver<PodUpdate>) {
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        resync.tick().await;

        info!(
            resync_secs = self.resync_interval.as_secs(),
            "Starting sync loop"
        );
        loop {
            let mut sync_types = SyncTypes::new();
            let open = tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => {
                        self.apply(update, &mut sync_types);
                        self.drain(&mut updates, &mut sync_types).await
                    }
                    None => false,
                },
                _ = resync.tick() => true,
            };

            if !open && sync_types.is_empty() {
                break;
            }
            self.sync(&sync_types).await;
            resync.reset();
            if !open {
                break;
            }
        }
        info!("Pod update channel closed, sync loop exiting");
    }

    fn apply(&self, update: PodUpdate, sync_types: &mut SyncTypes) {
        let source = update.source.clone();
        debug!(
            source = %source,
            op = ?update.op,
            pods = update.pods.len(),
            "Received pod update"
        );
        self.agent
            .state()
            .pod_manager
            .update_pods(update, sync_types);
        self.agent.sources_ready().mark_seen(&source);
    }

    /// Fold updates arriving within the drain window into `sync_types`.
    ///
    /// Returns false if the channel closed.
    async fn drain(
        &self,
        updates: &mut mpsc::Receiver<PodUpdate>,
        sync_types: &mut SyncTypes,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + self.drain_window;
        loop {
            match tokio::time::timeout_at(deadline, updates.recv()).await {
                Ok(Some(update)) => self.apply(update, sync_types),
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }

    async fn sync(&self, sync_types: &SyncTypes) {
        let start = Instant::now();
        let (pods, mirrors) = self.agent.state().pod_manager.pods_and_mirror_map();
        if let Err(e) = self
            .agent
            .sync_pods(&pods, sync_types, &mirrors, start)
            .await
        {
            error!(error = %e, "Couldn't sync containers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::sources::SourcesReady;
    use crate::state::mock::TestAgent;
    use chrono::Utc;
    use nodelet_core::{
        Container, ContainerId, Pod, PodSpec, PodStatus, PodUid, API_SOURCE,
    };
    use nodelet_runtime::{RunningContainer, RunningPod};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn pod(uid: &str) -> Pod {
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
                    image: "busybox".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: PodStatus::default(),
        }
    }

    fn agent(dir: &TempDir) -> (TestAgent, Arc<NodeAgent>) {
        let t = TestAgent::with_config(AgentConfig {
            hostname: "node-1".to_string(),
            root_dir: dir.path().to_path_buf(),
            orphaned_volume_grace_secs: 0,
            resync_interval_secs: 10,
            drain_window_ms: 5,
            ..AgentConfig::default()
        });
        let sources = Arc::new(SourcesReady::new([API_SOURCE]));
        let agent = Arc::new(NodeAgent::new(t.state.clone(), sources));
        (t, agent)
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
    async fn updates_reach_the_runtime() {
        let dir = TempDir::new().unwrap();
        let (t, agent) = agent(&dir);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(MainLoop::new(agent.clone()).run(rx));

        tx.send(PodUpdate::set(API_SOURCE, vec![pod("a"), pod("b")]))
            .await
            .unwrap();
        let a = PodUid::new("a").unwrap();
        let b = PodUid::new("b").unwrap();
        wait_for(|| t.runtime.sync_count(&a) == 1 && t.runtime.sync_count(&b) == 1).await;
        assert!(agent.sources_ready().all_ready());
        assert_eq!(agent.pods().len(), 2);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_drain_window_is_one_pass() {
        let dir = TempDir::new().unwrap();
        let (t, agent) = agent(&dir);
        let (tx, rx) = mpsc::channel(8);

        // Queued before the loop starts, so both land in one drain window.
        tx.send(PodUpdate::set(API_SOURCE, vec![pod("a"), pod("b")]))
            .await
            .unwrap();
        tx.send(PodUpdate::remove(API_SOURCE, vec![pod("a")]))
            .await
            .unwrap();
        let handle = tokio::spawn(MainLoop::new(agent).run(rx));

        let b = PodUid::new("b").unwrap();
        wait_for(|| t.runtime.sync_count(&b) == 1).await;
        assert_eq!(t.runtime.sync_count(&PodUid::new("a").unwrap()), 0);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resync_tick_kills_strays() {
        let dir = TempDir::new().unwrap();
        let (t, agent) = agent(&dir);
        agent.sources_ready().mark_seen(API_SOURCE);
        t.runtime.insert_running(RunningPod {
            id: PodUid::new("stray").unwrap(),
            name: "stray".to_string(),
            namespace: "default".to_string(),
            containers: vec![RunningContainer {
                id: ContainerId::new("memory://stray-app-0"),
                name: "app".to_string(),
                image: "busybox".to_string(),
            }],
        });

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(MainLoop::new(agent).run(rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(t.runtime.killed().is_empty());

        wait_for(|| t.runtime.killed().len() == 1).await;

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_when_senders_drop() {
        let dir = TempDir::new().unwrap();
        let (_t, agent) = agent(&dir);
        let (tx, rx) = mpsc::channel::<PodUpdate>(1);
        drop(tx);
        MainLoop::new(agent).run(rx).await;
    }
}
