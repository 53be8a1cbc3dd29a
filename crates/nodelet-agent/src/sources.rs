//! Config source tracking and the local manifest source.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nodelet_core::{Pod, CONFIG_HASH_ANNOTATION, CONFIG_SOURCE_ANNOTATION, FILE_SOURCE};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::update::PodUpdate;
use crate::Result;

/// Tracks which config sources have delivered at least one update.
///
/// Cleanup that deletes workloads waits until every expected source has
/// reported, so pods from a slow source are not killed at startup.
#[derive(Debug)]
pub struct SourcesReady {
    expected: HashSet<String>,
    seen: RwLock<HashSet<String>>,
}

impl SourcesReady {
    /// Track the given sources.
    #[must_use]
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: expected.into_iter().map(Into::into).collect(),
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Record that a source has delivered an update.
    pub fn mark_seen(&self, source: &str) {
        if !self.seen.read().contains(source) {
            self.seen.write().insert(source.to_string());
        }
    }

    /// Return true once every expected source has reported.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        let seen = self.seen.read();
        self.expected.iter().all(|s| seen.contains(s))
    }
}

/// Reads pod manifests from a directory.
///
/// Each `*.json` file holds one pod. Pods are annotated with the `file` source
/// and their config hash, so they are treated as static pods.
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: PathBuf,
}

impl FileSource {
    /// Read manifests from `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The manifest directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every manifest in the directory.
    ///
    /// A missing directory yields no pods. Files that fail to parse are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    pub async fn load(&self) -> Result<Vec<Pod>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut pods = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Pod>(&bytes) {
                Ok(mut pod) => {
                    pod.annotations
                        .insert(CONFIG_SOURCE_ANNOTATION.to_string(), FILE_SOURCE.to_string());
                    let hash = pod.config_hash();
                    pod.annotations
                        .entry(CONFIG_HASH_ANNOTATION.to_string())
                        .or_insert(hash);
                    pods.push(pod);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid pod manifest");
                }
            }
        }
        Ok(pods)
    }

    /// Deliver the manifest set on `tx` every `interval` until the receiver
    /// closes.
    pub async fn run(self, tx: mpsc::Sender<PodUpdate>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let pods = match self.load().await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Failed to read manifests");
                    continue;
                }
            };
            debug!(count = pods.len(), "Loaded static pod manifests");
            if tx.send(PodUpdate::set(FILE_SOURCE, pods)).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sources_ready_waits_for_every_source() {
        let ready = SourcesReady::new(["api", "file"]);
        assert!(!ready.all_ready());
        ready.mark_seen("file");
        assert!(!ready.all_ready());
        ready.mark_seen("api");
        assert!(ready.all_ready());
    }

    #[test]
    fn no_expected_sources_is_ready() {
        let ready = SourcesReady::new(Vec::<String>::new());
        assert!(ready.all_ready());
    }

    #[tokio::test]
    async fn file_source_loads_manifests() {
        let dir = TempDir::new().unwrap();
        let manifest = serde_json::json!({
            "uid": "static-1",
            "namespace": "kube-system",
            "name": "etcd",
            "creation_timestamp": "2024-01-01T00:00:00Z",
            "spec": {
                "containers": [{"name": "etcd", "image": "etcd:3"}]
            }
        });
        std::fs::write(dir.path().join("etcd.json"), manifest.to_string()).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let pods = FileSource::new(dir.path()).load().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].source(), Some(FILE_SOURCE));
        assert!(pods[0].is_static());
        assert!(pods[0].annotations.contains_key(CONFIG_HASH_ANNOTATION));
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let pods = FileSource::new(dir.path().join("absent")).load().await.unwrap();
        assert!(pods.is_empty());
    }
}
