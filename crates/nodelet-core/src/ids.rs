//! Identifier types for nodelet.
//!
//! Pods are identified by an opaque UID assigned by their config source, and
//! containers by an ID assigned by the container runtime. Both are kept as
//! strings because neither side guarantees a fixed format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The unique identifier of a pod.
///
/// UIDs come from the control plane for scheduled pods and from the file
/// source for static pods. A UID survives every spec update of the same pod.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodUid(String);

impl PodUid {
    /// Create a `PodUid` from a string, rejecting empty values and path separators.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty or would escape a directory
    /// when used as a path component.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.contains('/') || value == "." || value == ".." {
            return Err(IdError::InvalidPathComponent(value));
        }
        Ok(Self(value))
    }

    /// Generate a random UID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Return the UID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PodUid({})", self.0)
    }
}

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PodUid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PodUid {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PodUid> for String {
    fn from(id: PodUid) -> Self {
        id.0
    }
}

impl AsRef<str> for PodUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A container ID as reported by the runtime.
///
/// Runtimes report IDs as `<runtime>://<id>`; the prefix is kept for display
/// and stripped by [`ContainerId::trimmed`] for lookups.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a container ID from its raw form.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Return the ID with any `<runtime>://` prefix removed.
    #[must_use]
    pub fn trimmed(&self) -> &str {
        self.0
            .split_once("://")
            .map_or(self.0.as_str(), |(_, id)| id)
    }

    /// Return the raw ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier was empty.
    #[error("identifier is empty")]
    Empty,

    /// The identifier cannot be used as a single path component.
    #[error("identifier {0:?} is not a valid path component")]
    InvalidPathComponent(String),
}
