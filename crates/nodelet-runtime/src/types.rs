//! Types exchanged with a container runtime.

use std::fmt;

use nodelet_core::{full_name, ContainerId, Pod, PodUid};
use serde::{Deserialize, Serialize};

use crate::kind::RuntimeKind;

/// The runtime's observed view of a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningPod {
    /// UID of the pod the containers belong to.
    pub id: PodUid,
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Containers currently present.
    pub containers: Vec<RunningContainer>,
}

impl RunningPod {
    /// A running pod with no containers, used when the runtime has nothing
    /// for a desired pod yet.
    #[must_use]
    pub fn empty(pod: &Pod) -> Self {
        Self {
            id: pod.uid.clone(),
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            containers: Vec::new(),
        }
    }

    /// Return the `name_namespace` key.
    #[must_use]
    pub fn full_name(&self) -> String {
        full_name(&self.name, &self.namespace)
    }

    /// Return true if no containers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Find the running pod with the given UID.
    #[must_use]
    pub fn find<'a>(pods: &'a [Self], uid: &PodUid) -> Option<&'a Self> {
        pods.iter().find(|p| &p.id == uid)
    }
}

/// A container as seen by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningContainer {
    /// Runtime-assigned ID.
    pub id: ContainerId,
    /// Container name from the pod spec.
    pub name: String,
    /// Image the container runs.
    pub image: String,
}

/// Version reported by a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeVersion {
    /// Which runtime answered.
    pub kind: RuntimeKind,
    /// Its version string.
    pub version: String,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.version)
    }
}

/// What a garbage collection pass reclaims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcTarget {
    /// Dead containers and their logs.
    Containers,
    /// Images no container uses.
    Images,
}

impl fmt::Display for GcTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Containers => write!(f, "containers"),
            Self::Images => write!(f, "images"),
        }
    }
}

/// Options for fetching container logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Stream new output as it arrives.
    #[serde(default)]
    pub follow: bool,
    /// Read the logs of the previous, terminated instance.
    #[serde(default)]
    pub previous: bool,
    /// Only return this many trailing lines.
    #[serde(default)]
    pub tail_lines: Option<usize>,
    /// Prefix each line with its timestamp.
    #[serde(default)]
    pub timestamps: bool,
}
