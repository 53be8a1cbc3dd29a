//! Common error types for nodelet.
//!
//! This module provides shared error types that are used across multiple crates.

use crate::ids::{IdError, PodUid};
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout nodelet.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A pod with the specified UID was not found.
    #[error("pod not found: {0}")]
    PodNotFound(PodUid),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// A manifest could not be decoded.
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] serde_json::Error),
}
