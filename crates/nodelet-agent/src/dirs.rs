//! On-disk layout of per-pod state.
//!
//! ```text
//! <root>/pods/<uid>/volumes/<plugin>/<volume>
//! <root>/pods/<uid>/plugins/<plugin>
//! <root>/pods/<uid>/containers/<container>
//! ```
//!
//! Older agents kept pod directories directly under `<root>`; those are still
//! read but never written.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use nodelet_core::PodUid;
use tracing::{debug, warn};

use crate::Result;

/// Which of two candidate paths to use for a piece of per-pod state.
///
/// Prefers the new layout. Falls back to the legacy path only when it alone
/// exists. When both exist the new path wins and a warning is logged.
#[must_use]
pub fn resolve_legacy(legacy: PathBuf, new: PathBuf, legacy_exists: bool, new_exists: bool) -> PathBuf {
    match (legacy_exists, new_exists) {
        (true, false) => legacy,
        (true, true) => {
            warn!(
                legacy = %legacy.display(),
                path = %new.display(),
                "Both legacy and current pod directories exist; using current"
            );
            new
        }
        _ => new,
    }
}

/// Paths of the agent's per-pod state.
#[derive(Debug, Clone)]
pub struct PodDirs {
    root: PathBuf,
}

impl PodDirs {
    /// Layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Agent root directory.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Directory holding every pod directory.
    #[must_use]
    pub fn pods_dir(&self) -> PathBuf {
        self.root.join("pods")
    }

    /// Directory of one pod, honouring a legacy layout left on disk.
    #[must_use]
    pub fn pod_dir(&self, uid: &PodUid) -> PathBuf {
        let new = self.pods_dir().join(uid.as_str());
        let legacy = self.root.join(uid.as_str());
        resolve_legacy(legacy.clone(), new.clone(), legacy.is_dir(), new.is_dir())
    }

    /// Directory holding a pod's volumes.
    #[must_use]
    pub fn pod_volumes_dir(&self, uid: &PodUid) -> PathBuf {
        self.pod_dir(uid).join("volumes")
    }

    /// Directory of one volume.
    #[must_use]
    pub fn pod_volume_dir(&self, uid: &PodUid, plugin: &str, volume: &str) -> PathBuf {
        self.pod_volumes_dir(uid).join(plugin).join(volume)
    }

    /// Directory holding a pod's plugin state.
    #[must_use]
    pub fn pod_plugins_dir(&self, uid: &PodUid) -> PathBuf {
        self.pod_dir(uid).join("plugins")
    }

    /// Directory holding a pod's per-container state.
    #[must_use]
    pub fn pod_containers_dir(&self, uid: &PodUid) -> PathBuf {
        self.pod_dir(uid).join("containers")
    }

    /// Directory of static pod manifests.
    #[must_use]
    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    /// Create the root, pods and manifests directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub async fn make_root_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.pods_dir(), self.manifests_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Create the directories a pod needs.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub async fn make_pod_data_dirs(&self, uid: &PodUid) -> Result<()> {
        for dir in [
            self.pod_dir(uid),
            self.pod_volumes_dir(uid),
            self.pod_plugins_dir(uid),
            self.pod_containers_dir(uid),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// UIDs with a pod directory under either layout.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed.
    pub async fn list_pod_uids_on_disk(&self) -> Result<Vec<PodUid>> {
        let mut uids = HashSet::new();
        for uid in list_dir_names(&self.pods_dir()).await? {
            uids.insert(uid);
        }
        // Legacy layout: any directory under root that is a valid UID.
        for name in list_dir_names(&self.root).await? {
            if name.as_str() != "pods" && name.as_str() != "manifests" {
                uids.insert(name);
            }
        }
        let mut uids: Vec<_> = uids.into_iter().collect();
        uids.sort();
        Ok(uids)
    }

    /// Remove the directory of a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub async fn remove_pod_dir(&self, uid: &PodUid) -> Result<()> {
        let dir = self.pod_dir(uid);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(uid = %uid, path = %dir.display(), "Removed pod directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn list_dir_names(dir: &Path) -> Result<Vec<PodUid>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Ok(uid) = PodUid::new(name) {
            names.push(uid);
        }
    }
    Ok(names)
}
