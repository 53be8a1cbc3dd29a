//! Host machine information.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nodelet_core::MachineInfo;
use parking_lot::RwLock;
use tracing::debug;

use crate::{AgentError, Result};

/// Source of static facts about the host.
#[async_trait]
pub trait MachineInfoProvider: Send + Sync {
    /// Read the machine's hardware and identity facts.
    ///
    /// # Errors
    ///
    /// Returns an error if the facts cannot be read.
    async fn machine_info(&self) -> Result<MachineInfo>;
}

/// Reads machine facts from procfs and sysfs under a root path.
#[derive(Debug, Clone)]
pub struct HostMachineInfo {
    root: PathBuf,
}

impl Default for HostMachineInfo {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostMachineInfo {
    /// Create a reader rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_trimmed(&self, rel: &str) -> Option<String> {
        let path = self.root.join(rel);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Some(s.trim().to_string()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Cannot read machine fact");
                None
            }
        }
    }
}

/// Parse `MemTotal` from the contents of `/proc/meminfo`, in bytes.
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let mut fields = line.split_whitespace().skip(1);
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

#[async_trait]
impl MachineInfoProvider for HostMachineInfo {
    async fn machine_info(&self) -> Result<MachineInfo> {
        let meminfo = self
            .read_trimmed("proc/meminfo")
            .await
            .ok_or_else(|| AgentError::Config("cannot read /proc/meminfo".to_string()))?;
        let memory_capacity = parse_mem_total(&meminfo)
            .ok_or_else(|| AgentError::Config("MemTotal missing from /proc/meminfo".to_string()))?;
        let num_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .map_err(AgentError::Io)?;

        Ok(MachineInfo {
            num_cores,
            memory_capacity,
            machine_id: self.read_trimmed("etc/machine-id").await.unwrap_or_default(),
            system_uuid: self
                .read_trimmed("sys/class/dmi/id/product_uuid")
                .await
                .unwrap_or_default(),
            boot_id: self
                .read_trimmed("proc/sys/kernel/random/boot_id")
                .await
                .unwrap_or_default(),
        })
    }
}

/// Caches machine facts after the first successful read.
pub struct CachedMachineInfo {
    inner: Arc<dyn MachineInfoProvider>,
    cached: RwLock<Option<MachineInfo>>,
}

impl CachedMachineInfo {
    /// Wrap a provider.
    #[must_use]
    pub fn new(inner: Arc<dyn MachineInfoProvider>) -> Self {
        Self {
            inner,
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl MachineInfoProvider for CachedMachineInfo {
    async fn machine_info(&self) -> Result<MachineInfo> {
        if let Some(info) = self.cached.read().clone() {
            return Ok(info);
        }
        let info = self.inner.machine_info().await?;
        *self.cached.write() = Some(info.clone());
        Ok(info)
    }
}

/// Test doubles for machine facts.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::{async_trait, MachineInfo, MachineInfoProvider};
    use crate::{AgentError, Result};
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider returning a settable value.
    #[derive(Debug, Default)]
    pub struct StaticMachineInfo {
        info: RwLock<Option<MachineInfo>>,
        calls: AtomicUsize,
    }

    impl StaticMachineInfo {
        /// Create a provider that returns `info`.
        #[must_use]
        pub fn new(info: MachineInfo) -> Self {
            Self {
                info: RwLock::new(Some(info)),
                calls: AtomicUsize::new(0),
            }
        }

        /// Create a provider that always fails.
        #[must_use]
        pub fn failing() -> Self {
            Self::default()
        }

        /// Replace the returned value.
        pub fn set(&self, info: Option<MachineInfo>) {
            *self.info.write() = info;
        }

        /// Number of reads.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MachineInfoProvider for StaticMachineInfo {
        async fn machine_info(&self) -> Result<MachineInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.info
                .read()
                .clone()
                .ok_or_else(|| AgentError::Config("machine info unavailable".to_string()))
        }
    }
}
