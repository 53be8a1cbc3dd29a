//! Running pod cache.
//!
//! Listing pods is the most frequent runtime call. [`CachedRuntime`] keeps the
//! last listing for a short TTL and serves it when the caller allows a cached
//! answer. Syncs and kills change what is running, so each one drops the
//! cached listing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodelet_core::{ContainerId, Pod, PodStatus, Secret};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::{ContainerRuntime, GcTarget, LogOptions, Result, RunningPod, RuntimeVersion};

/// A runtime wrapper that caches `get_pods`.
pub struct CachedRuntime {
    inner: Arc<dyn ContainerRuntime>,
    ttl: Duration,
    cache: RwLock<Option<(Instant, Vec<RunningPod>)>>,
}

impl CachedRuntime {
    /// Wrap a runtime with a cache of the given TTL.
    #[must_use]
    pub fn new(inner: Arc<dyn ContainerRuntime>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Drop the cached listing.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    fn fresh(&self) -> Option<Vec<RunningPod>> {
        let cache = self.cache.read();
        let (at, pods) = cache.as_ref()?;
        (at.elapsed() < self.ttl).then(|| pods.clone())
    }
}

#[async_trait]
impl ContainerRuntime for CachedRuntime {
    async fn version(&self) -> Result<RuntimeVersion> {
        self.inner.version().await
    }

    async fn get_pods(&self, use_cache: bool) -> Result<Vec<RunningPod>> {
        if use_cache {
            if let Some(pods) = self.fresh() {
                return Ok(pods);
            }
        }

        let pods = self.inner.get_pods(false).await?;
        *self.cache.write() = Some((Instant::now(), pods.clone()));
        Ok(pods)
    }

    async fn sync_pod(
        &self,
        pod: &Pod,
        running: &RunningPod,
        status: &PodStatus,
        pull_secrets: &[Secret],
    ) -> Result<()> {
        let result = self.inner.sync_pod(pod, running, status, pull_secrets).await;
        self.invalidate();
        result
    }

    async fn kill_pod(&self, running: &RunningPod) -> Result<()> {
        let result = self.inner.kill_pod(running).await;
        self.invalidate();
        result
    }

    async fn get_pod_status(&self, pod: &Pod) -> Result<PodStatus> {
        self.inner.get_pod_status(pod).await
    }

    async fn get_container_logs(
        &self,
        pod: &Pod,
        container_id: &ContainerId,
        opts: &LogOptions,
    ) -> Result<String> {
        self.inner.get_container_logs(pod, container_id, opts).await
    }

    async fn garbage_collect(&self, target: GcTarget) -> Result<()> {
        self.inner.garbage_collect(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRuntime;
    use chrono::Utc;
    use nodelet_core::{Container, PodSpec, PodUid};
    use std::collections::BTreeMap;

    fn running(uid: &str) -> RunningPod {
        RunningPod {
            id: PodUid::new(uid).unwrap(),
            name: uid.to_string(),
            namespace: "default".to_string(),
            containers: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cached_listing_is_served_within_ttl() {
        let memory = Arc::new(MemoryRuntime::new());
        let cached = CachedRuntime::new(memory.clone(), Duration::from_secs(2));

        assert!(cached.get_pods(true).await.unwrap().is_empty());
        memory.insert_running(running("a"));

        // Stale cache still answers.
        assert!(cached.get_pods(true).await.unwrap().is_empty());

        // Bypassing the cache sees the new pod.
        assert_eq!(cached.get_pods(false).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_listing_expires() {
        let memory = Arc::new(MemoryRuntime::new());
        let cached = CachedRuntime::new(memory.clone(), Duration::from_secs(2));

        assert!(cached.get_pods(true).await.unwrap().is_empty());
        memory.insert_running(running("a"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cached.get_pods(true).await.unwrap().len(), 1);
    }

    fn desired(uid: &str) -> Pod {
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

    #[tokio::test(start_paused = true)]
    async fn sync_and_kill_drop_cached_listing() {
        let memory = Arc::new(MemoryRuntime::new());
        let cached = CachedRuntime::new(memory.clone(), Duration::from_secs(60));
        let pod = desired("a");

        assert!(cached.get_pods(true).await.unwrap().is_empty());
        cached
            .sync_pod(&pod, &RunningPod::empty(&pod), &PodStatus::default(), &[])
            .await
            .unwrap();
        let pods = cached.get_pods(true).await.unwrap();
        assert_eq!(pods.len(), 1);

        cached.kill_pod(&pods[0]).await.unwrap();
        assert!(cached.get_pods(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let memory = Arc::new(MemoryRuntime::new());
        let cached = CachedRuntime::new(memory.clone(), Duration::from_secs(60));

        assert!(cached.get_pods(true).await.unwrap().is_empty());
        memory.insert_running(running("a"));
        cached.invalidate();
        assert_eq!(cached.get_pods(true).await.unwrap().len(), 1);
    }
}
