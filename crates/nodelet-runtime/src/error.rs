//! Error types for the runtime crate.

use nodelet_core::{ContainerId, PodUid};
use thiserror::Error;

use crate::kind::RuntimeKind;

/// Errors reported by a container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The runtime is busy and the call may succeed if retried later.
    #[error("resource temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// The runtime did not answer.
    #[error("container runtime is down: {0}")]
    Unavailable(String),

    /// No running pod with the given UID.
    #[error("pod not found: {0}")]
    PodNotFound(PodUid),

    /// No container with the given ID.
    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),

    /// The configured runtime kind has no driver in this build.
    #[error("unsupported container runtime: {0}")]
    Unsupported(RuntimeKind),

    /// The runtime kind string could not be parsed.
    #[error("unknown container runtime: {0}")]
    UnknownKind(String),

    /// I/O error talking to the runtime.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other runtime failure.
    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Check if this error is transient.
    ///
    /// Transient errors are propagated without caching a status so the next
    /// pass retries.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TemporarilyUnavailable(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

/// A specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
