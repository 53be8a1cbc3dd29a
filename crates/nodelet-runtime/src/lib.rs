//! Container runtime boundary for nodelet.
//!
//! This crate defines the [`ContainerRuntime`] capability the node agent
//! drives, plus the pieces around it:
//!
//! - [`RuntimeKind`]: the closed set of runtimes, resolved once at startup
//! - [`CachedRuntime`]: a TTL cache in front of `get_pods`
//! - [`MemoryRuntime`]: an in-process runtime for dry runs and tests
//!
//! # Example
//!
//! ```
//! use nodelet_runtime::{CachedRuntime, ContainerRuntime, RuntimeKind};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = RuntimeKind::Memory.connect()?;
//! let cached = CachedRuntime::new(runtime, Duration::from_secs(2));
//! let pods = cached.get_pods(true).await?;
//! assert!(pods.is_empty());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod error;
pub mod kind;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use nodelet_core::{ContainerId, Pod, PodStatus, Secret};

pub use cache::CachedRuntime;
pub use error::{Result, RuntimeError};
pub use kind::RuntimeKind;
pub use memory::MemoryRuntime;
pub use types::{GcTarget, LogOptions, RunningContainer, RunningPod, RuntimeVersion};

/// The operations the agent needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Report the runtime version. Also serves as the liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime does not answer.
    async fn version(&self) -> Result<RuntimeVersion>;

    /// List the pods the runtime knows about.
    ///
    /// `use_cache` allows a recently cached answer; implementations without
    /// a cache ignore it.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be listed.
    async fn get_pods(&self, use_cache: bool) -> Result<Vec<RunningPod>>;

    /// Create, update or remove containers so `running` matches `pod`.
    ///
    /// # Errors
    ///
    /// Returns an error if any container operation fails.
    async fn sync_pod(
        &self,
        pod: &Pod,
        running: &RunningPod,
        status: &PodStatus,
        pull_secrets: &[Secret],
    ) -> Result<()>;

    /// Stop and remove every container of a running pod.
    ///
    /// # Errors
    ///
    /// Returns an error if any container cannot be killed.
    async fn kill_pod(&self, running: &RunningPod) -> Result<()>;

    /// Inspect the containers of a pod.
    ///
    /// The returned status carries per-container state; the phase is left for
    /// the caller to derive.
    ///
    /// # Errors
    ///
    /// Returns a transient error when the runtime is busy, or another error
    /// when inspection fails.
    async fn get_pod_status(&self, pod: &Pod) -> Result<PodStatus>;

    /// Read the logs of one container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown.
    async fn get_container_logs(
        &self,
        pod: &Pod,
        container_id: &ContainerId,
        opts: &LogOptions,
    ) -> Result<String>;

    /// Reclaim dead containers or unused images.
    ///
    /// Retention policy belongs to the runtime; the agent only decides when
    /// a pass runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass could not complete.
    async fn garbage_collect(&self, target: GcTarget) -> Result<()>;
}
