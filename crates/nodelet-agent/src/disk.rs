//! Disk space checks used by admission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::{AgentError, Result};

const MB: u64 = 1024 * 1024;

/// Capacity and free space of one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsInfo {
    /// Total bytes.
    pub capacity: u64,
    /// Bytes available to unprivileged users.
    pub available: u64,
}

/// Measures the filesystems the agent cares about.
pub trait FsInfoProvider: Send + Sync {
    /// Filesystem holding the container runtime's storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be measured.
    fn runtime_fs_info(&self) -> Result<FsInfo>;

    /// Filesystem holding the agent's root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be measured.
    fn root_fs_info(&self) -> Result<FsInfo>;
}

/// Provider for hosts where filesystem measurement is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnmeasuredFs;

impl FsInfoProvider for UnmeasuredFs {
    fn runtime_fs_info(&self) -> Result<FsInfo> {
        Err(AgentError::Config("filesystem stats unavailable".to_string()))
    }

    fn root_fs_info(&self) -> Result<FsInfo> {
        Err(AgentError::Config("filesystem stats unavailable".to_string()))
    }
}

/// Decides whether there is room for new pods.
pub trait DiskSpaceManager: Send + Sync {
    /// Whether the runtime's filesystem has space.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be measured.
    fn is_runtime_disk_space_available(&self) -> Result<bool>;

    /// Whether the root filesystem has space.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be measured.
    fn is_root_disk_space_available(&self) -> Result<bool>;

    /// Mark that measurements may now be trusted.
    fn unfreeze(&self);
}

/// Minimum free space, in MB, per filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpacePolicy {
    /// Threshold for the runtime filesystem.
    pub runtime_free_disk_mb: u64,
    /// Threshold for the root filesystem.
    pub root_free_disk_mb: u64,
}

impl Default for DiskSpacePolicy {
    fn default() -> Self {
        Self {
            runtime_free_disk_mb: 256,
            root_free_disk_mb: 256,
        }
    }
}

/// Compares measured free space against fixed thresholds.
///
/// Starts frozen: until [`DiskSpaceManager::unfreeze`] is called every
/// check reports space available.
pub struct ThresholdDiskManager {
    provider: Arc<dyn FsInfoProvider>,
    policy: DiskSpacePolicy,
    frozen: AtomicBool,
}

impl ThresholdDiskManager {
    /// Create a frozen manager.
    ///
    /// # Errors
    ///
    /// Returns an error if a threshold is zero.
    pub fn new(provider: Arc<dyn FsInfoProvider>, policy: DiskSpacePolicy) -> Result<Self> {
        if policy.runtime_free_disk_mb == 0 || policy.root_free_disk_mb == 0 {
            return Err(AgentError::Config(
                "free disk space thresholds must be positive".to_string(),
            ));
        }
        Ok(Self {
            provider,
            policy,
            frozen: AtomicBool::new(true),
        })
    }

    fn has_space(&self, info: Result<FsInfo>, threshold_mb: u64) -> Result<bool> {
        if self.frozen.load(Ordering::Acquire) {
            return Ok(true);
        }
        let info = info?;
        let available_mb = info.available / MB;
        if available_mb < threshold_mb {
            warn!(
                available_mb,
                threshold_mb, "Running out of disk space"
            );
            return Ok(false);
        }
        Ok(true)
    }
}

impl DiskSpaceManager for ThresholdDiskManager {
    fn is_runtime_disk_space_available(&self) -> Result<bool> {
        self.has_space(
            self.provider.runtime_fs_info(),
            self.policy.runtime_free_disk_mb,
        )
    }

    fn is_root_disk_space_available(&self) -> Result<bool> {
        self.has_space(self.provider.root_fs_info(), self.policy.root_free_disk_mb)
    }

    fn unfreeze(&self) {
        self.frozen.store(false, Ordering::Release);
    }
}

/// Test doubles for disk measurement.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::{FsInfo, FsInfoProvider, MB};
    use crate::{AgentError, Result};
    use parking_lot::RwLock;

    /// Provider returning settable free space.
    #[derive(Debug, Default)]
    pub struct FakeFs {
        runtime: RwLock<Option<FsInfo>>,
        root: RwLock<Option<FsInfo>>,
    }

    impl FakeFs {
        /// Create a provider that fails until values are set.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Set free space of the runtime filesystem, in MB.
        pub fn set_runtime_free_mb(&self, mb: u64) {
            *self.runtime.write() = Some(FsInfo {
                capacity: mb.saturating_mul(2) * MB,
                available: mb * MB,
            });
        }

        /// Set free space of the root filesystem, in MB.
        pub fn set_root_free_mb(&self, mb: u64) {
            *self.root.write() = Some(FsInfo {
                capacity: mb.saturating_mul(2) * MB,
                available: mb * MB,
            });
        }
    }

    impl FsInfoProvider for FakeFs {
        fn runtime_fs_info(&self) -> Result<FsInfo> {
            self.runtime
                .read()
                .ok_or_else(|| AgentError::Config("runtime fs not measured".to_string()))
        }

        fn root_fs_info(&self) -> Result<FsInfo> {
            self.root
                .read()
                .ok_or_else(|| AgentError::Config("root fs not measured".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::FakeFs;
    use super::*;

    fn manager(fs: Arc<FakeFs>) -> ThresholdDiskManager {
        ThresholdDiskManager::new(
            fs,
            DiskSpacePolicy {
                runtime_free_disk_mb: 100,
                root_free_disk_mb: 50,
            },
        )
        .unwrap()
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let policy = DiskSpacePolicy {
            runtime_free_disk_mb: 0,
            root_free_disk_mb: 10,
        };
        assert!(ThresholdDiskManager::new(Arc::new(UnmeasuredFs), policy).is_err());
    }

    #[test]
    fn frozen_manager_reports_space() {
        let fs = Arc::new(FakeFs::new());
        fs.set_runtime_free_mb(1);
        fs.set_root_free_mb(1);
        let dm = manager(fs);
        assert!(dm.is_runtime_disk_space_available().unwrap());
        assert!(dm.is_root_disk_space_available().unwrap());

        dm.unfreeze();
        assert!(!dm.is_runtime_disk_space_available().unwrap());
        assert!(!dm.is_root_disk_space_available().unwrap());
    }

    #[test]
    fn thresholds_are_independent() {
        let fs = Arc::new(FakeFs::new());
        fs.set_runtime_free_mb(150);
        fs.set_root_free_mb(40);
        let dm = manager(fs.clone());
        dm.unfreeze();
        assert!(dm.is_runtime_disk_space_available().unwrap());
        assert!(!dm.is_root_disk_space_available().unwrap());

        fs.set_root_free_mb(50);
        assert!(dm.is_root_disk_space_available().unwrap());
    }

    #[test]
    fn measurement_errors_surface_after_unfreeze() {
        let dm = ThresholdDiskManager::new(Arc::new(UnmeasuredFs), DiskSpacePolicy::default())
            .unwrap();
        assert!(dm.is_root_disk_space_available().unwrap());
        dm.unfreeze();
        assert!(dm.is_root_disk_space_available().is_err());
    }
}
