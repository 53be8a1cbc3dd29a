//! Pod volumes: setup, bookkeeping and orphan teardown.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use nodelet_core::{Pod, PodUid, VolumeSource};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dirs::PodDirs;
use crate::error::AggregateError;
use crate::{AgentError, Result};

/// A volume set up for a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// Plugin that set it up.
    pub plugin: String,
    /// Path containers see.
    pub path: PathBuf,
}

/// Volumes of one pod by volume name.
pub type VolumeMap = HashMap<String, MountedVolume>;

/// A volume directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OnDiskVolume {
    /// Owning pod.
    pub uid: PodUid,
    /// Plugin directory it lives under.
    pub plugin: String,
    /// Volume name.
    pub name: String,
}

/// Tracks the volumes mounted for each pod.
#[derive(Debug, Default)]
pub struct VolumeManager {
    volumes: RwLock<HashMap<PodUid, VolumeMap>>,
}

impl VolumeManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the volumes of a pod.
    pub fn set_volumes(&self, uid: &PodUid, volumes: VolumeMap) {
        self.volumes.write().insert(uid.clone(), volumes);
    }

    /// Return the volumes of a pod, if any were recorded.
    #[must_use]
    pub fn get_volumes(&self, uid: &PodUid) -> Option<VolumeMap> {
        self.volumes.read().get(uid).cloned()
    }

    /// Forget the volumes of a pod.
    pub fn delete_volumes(&self, uid: &PodUid) {
        self.volumes.write().remove(uid);
    }
}

/// Sets up and tears down volume directories.
pub struct VolumeMounter {
    dirs: PodDirs,
    grace: Duration,
    orphaned_since: Mutex<HashMap<OnDiskVolume, Instant>>,
}

impl VolumeMounter {
    /// Create a mounter over `dirs`.
    ///
    /// Orphaned volumes are torn down once they have stayed orphaned for
    /// `grace`.
    #[must_use]
    pub fn new(dirs: PodDirs, grace: Duration) -> Self {
        Self {
            dirs,
            grace,
            orphaned_since: Mutex::new(HashMap::new()),
        }
    }

    /// Set up every volume the pod declares.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first volume that could not be set up.
    pub async fn mount_external_volumes(&self, pod: &Pod) -> Result<VolumeMap> {
        let mut mounted = VolumeMap::new();
        for volume in &pod.spec.volumes {
            let plugin = volume.source.plugin_name();
            let path = match &volume.source {
                VolumeSource::EmptyDir => {
                    let dir = self.dirs.pod_volume_dir(&pod.uid, plugin, &volume.name);
                    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                        AgentError::Volume(format!(
                            "failed to set up volume {} of pod {}: {e}",
                            volume.name,
                            pod.full_name()
                        ))
                    })?;
                    dir
                }
                VolumeSource::HostPath { path } => PathBuf::from(path),
            };
            debug!(pod = %pod.full_name(), volume = %volume.name, plugin, "Volume set up");
            mounted.insert(
                volume.name.clone(),
                MountedVolume {
                    plugin: plugin.to_string(),
                    path,
                },
            );
        }
        Ok(mounted)
    }

    /// List volume directories present on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod directories cannot be listed.
    pub async fn list_mounted(&self) -> Result<Vec<OnDiskVolume>> {
        let mut found = Vec::new();
        for uid in self.dirs.list_pod_uids_on_disk().await? {
            let volumes_dir = self.dirs.pod_volumes_dir(&uid);
            for plugin in read_dir_names(&volumes_dir).await? {
                for name in read_dir_names(&volumes_dir.join(&plugin)).await? {
                    found.push(OnDiskVolume {
                        uid: uid.clone(),
                        plugin: plugin.clone(),
                        name,
                    });
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Remove a volume directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub async fn tear_down(&self, volume: &OnDiskVolume) -> Result<()> {
        let dir = self
            .dirs
            .pod_volume_dir(&volume.uid, &volume.plugin, &volume.name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Volume(format!(
                "failed to tear down volume {} of pod {}: {e}",
                volume.name, volume.uid
            ))),
        }
    }

    /// Tear down volumes no desired pod references.
    ///
    /// `desired` holds `(uid, volume name)` pairs of non-terminated desired
    /// pods. Volumes of a pod still running are left alone, as are volumes
    /// orphaned for less than the grace period.
    ///
    /// # Errors
    ///
    /// Returns every teardown failure, aggregated.
    pub async fn cleanup_orphaned_volumes(
        &self,
        desired: &HashSet<(PodUid, String)>,
        running: &HashSet<PodUid>,
        manager: &VolumeManager,
    ) -> Result<()> {
        let now = Instant::now();
        let mut orphans = Vec::new();
        let mounted = self.list_mounted().await?;
        {
            let mut since = self.orphaned_since.lock();
            let present: HashSet<&OnDiskVolume> = mounted.iter().collect();
            since.retain(|v, _| present.contains(v));

            for volume in &mounted {
                if desired.contains(&(volume.uid.clone(), volume.name.clone())) {
                    since.remove(volume);
                    continue;
                }
                if running.contains(&volume.uid) {
                    // The runtime cache may lag behind a pod that is still up.
                    debug!(uid = %volume.uid, volume = %volume.name, "Orphaned volume still in use");
                    continue;
                }
                let first = *since.entry(volume.clone()).or_insert(now);
                if now.duration_since(first) >= self.grace {
                    orphans.push(volume.clone());
                }
            }
        }

        let mut errors = AggregateError::new();
        for volume in orphans {
            info!(uid = %volume.uid, volume = %volume.name, "Tearing down orphaned volume");
            match self.tear_down(&volume).await {
                Ok(()) => {
                    self.orphaned_since.lock().remove(&volume);
                    manager.delete_volumes(&volume.uid);
                }
                Err(e) => {
                    warn!(uid = %volume.uid, volume = %volume.name, error = %e, "Could not tear down volume");
                    errors.push(e);
                }
            }
        }
        errors.into_result()
    }
}

async fn read_dir_names(dir: &std::path::Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nodelet_core::{PodSpec, PodStatus, Volume};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn pod(uid: &str, volumes: Vec<Volume>) -> Pod {
        Pod {
            uid: PodUid::new(uid).unwrap(),
            namespace: "default".to_string(),
            name: uid.to_string(),
            creation_timestamp: Utc::now(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: PodSpec {
                volumes,
                ..Default::default()
            },
            status: PodStatus::default(),
        }
    }

    fn empty_dir(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            source: VolumeSource::EmptyDir,
        }
    }

    #[tokio::test]
    async fn mount_creates_empty_dirs_only() {
        let dir = TempDir::new().unwrap();
        let mounter = VolumeMounter::new(PodDirs::new(dir.path()), Duration::ZERO);
        let p = pod(
            "a",
            vec![
                empty_dir("scratch"),
                Volume {
                    name: "logs".to_string(),
                    source: VolumeSource::HostPath {
                        path: "/var/log".to_string(),
                    },
                },
            ],
        );

        let mounted = mounter.mount_external_volumes(&p).await.unwrap();
        assert_eq!(mounted["logs"].path, PathBuf::from("/var/log"));
        assert_eq!(mounted["scratch"].plugin, "empty-dir");
        assert!(mounted["scratch"].path.is_dir());

        let on_disk = mounter.list_mounted().await.unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].name, "scratch");
    }

    #[test]
    fn manager_bookkeeping() {
        let manager = VolumeManager::new();
        let uid = PodUid::new("a").unwrap();
        assert!(manager.get_volumes(&uid).is_none());
        manager.set_volumes(&uid, VolumeMap::new());
        assert!(manager.get_volumes(&uid).is_some());
        manager.delete_volumes(&uid);
        assert!(manager.get_volumes(&uid).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn orphans_wait_out_the_grace_period() {
        let dir = TempDir::new().unwrap();
        let mounter = VolumeMounter::new(PodDirs::new(dir.path()), Duration::from_secs(60));
        let manager = VolumeManager::new();
        mounter
            .mount_external_volumes(&pod("a", vec![empty_dir("v")]))
            .await
            .unwrap();
        mounter
            .mount_external_volumes(&pod("b", vec![empty_dir("v")]))
            .await
            .unwrap();

        let desired = HashSet::from([(PodUid::new("b").unwrap(), "v".to_string())]);
        let running = HashSet::new();

        mounter
            .cleanup_orphaned_volumes(&desired, &running, &manager)
            .await
            .unwrap();
        assert_eq!(mounter.list_mounted().await.unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        mounter
            .cleanup_orphaned_volumes(&desired, &running, &manager)
            .await
            .unwrap();
        let left = mounter.list_mounted().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].uid.as_str(), "b");
    }

    #[tokio::test]
    async fn running_pod_volumes_are_kept() {
        let dir = TempDir::new().unwrap();
        let mounter = VolumeMounter::new(PodDirs::new(dir.path()), Duration::ZERO);
        let manager = VolumeManager::new();
        mounter
            .mount_external_volumes(&pod("a", vec![empty_dir("v")]))
            .await
            .unwrap();

        let running = HashSet::from([PodUid::new("a").unwrap()]);
        mounter
            .cleanup_orphaned_volumes(&HashSet::new(), &running, &manager)
            .await
            .unwrap();
        assert_eq!(mounter.list_mounted().await.unwrap().len(), 1);

        mounter
            .cleanup_orphaned_volumes(&HashSet::new(), &HashSet::new(), &manager)
            .await
            .unwrap();
        assert!(mounter.list_mounted().await.unwrap().is_empty());
    }
}
