//! Desired-state update messages.

use std::collections::HashMap;

use nodelet_core::{Pod, PodUid};

/// How an update applies to the known pod set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOp {
    /// The pods are the complete set from the source.
    Set,
    /// The pods were added or changed.
    Update,
    /// The pods were removed.
    Remove,
}

/// A batch of desired pods delivered by a config source.
#[derive(Debug, Clone)]
pub struct PodUpdate {
    /// Pods in the batch.
    pub pods: Vec<Pod>,
    /// How to apply them.
    pub op: UpdateOp,
    /// Which source delivered them.
    pub source: String,
}

impl PodUpdate {
    /// Build a full-set update.
    #[must_use]
    pub fn set(source: impl Into<String>, pods: Vec<Pod>) -> Self {
        Self {
            pods,
            op: UpdateOp::Set,
            source: source.into(),
        }
    }

    /// Build an incremental update.
    #[must_use]
    pub fn update(source: impl Into<String>, pods: Vec<Pod>) -> Self {
        Self {
            pods,
            op: UpdateOp::Update,
            source: source.into(),
        }
    }

    /// Build a removal.
    #[must_use]
    pub fn remove(source: impl Into<String>, pods: Vec<Pod>) -> Self {
        Self {
            pods,
            op: UpdateOp::Remove,
            source: source.into(),
        }
    }
}

/// Why a pod is being synced in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncPodType {
    /// First time the pod is seen.
    Create,
    /// The pod's spec changed.
    Update,
    /// Periodic resync.
    #[default]
    Sync,
}

/// Sync classification for every pod in a pass, keyed by UID.
pub type SyncTypes = HashMap<PodUid, SyncPodType>;
