//! Pod specification types.
//!
//! A [`Pod`] is the desired workload as assigned to this node. It is replaced
//! wholesale on every update and never mutated in place by the agent.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::PodUid;
use crate::status::PodStatus;

/// Annotation recording which config source delivered a pod.
pub const CONFIG_SOURCE_ANNOTATION: &str = "nodelet.io/config.source";

/// Annotation recording the config hash of a static pod.
pub const CONFIG_HASH_ANNOTATION: &str = "nodelet.io/config.hash";

/// Annotation marking a mirror pod; its value is the config hash of the static pod it mirrors.
pub const CONFIG_MIRROR_ANNOTATION: &str = "nodelet.io/config.mirror";

/// Name of the control plane config source.
pub const API_SOURCE: &str = "api";

/// Name of the local manifest config source.
pub const FILE_SOURCE: &str = "file";

/// A pod as assigned to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Unique identifier.
    pub uid: PodUid,
    /// Namespace the pod lives in.
    pub namespace: String,
    /// Name of the pod within its namespace.
    pub name: String,
    /// Creation time, used to resolve admission conflicts.
    pub creation_timestamp: DateTime<Utc>,
    /// Labels attached to the pod.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations attached to the pod.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Desired state.
    pub spec: PodSpec,
    /// Status as last recorded by the control plane.
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Return the `name_namespace` key that identifies the pod across UIDs.
    #[must_use]
    pub fn full_name(&self) -> String {
        full_name(&self.name, &self.namespace)
    }

    /// Return the config source that delivered this pod, if recorded.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.annotations
            .get(CONFIG_SOURCE_ANNOTATION)
            .map(String::as_str)
    }

    /// A static pod is one defined locally rather than by the control plane.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.source().is_some_and(|source| source != API_SOURCE)
    }

    /// A mirror pod is the control-plane shadow of a static pod.
    #[must_use]
    pub fn is_mirror(&self) -> bool {
        self.annotations.contains_key(CONFIG_MIRROR_ANNOTATION)
    }

    /// Return the config hash of this pod.
    ///
    /// Uses the hash annotation when the source recorded one, and otherwise
    /// derives it from the identity and spec.
    #[must_use]
    pub fn config_hash(&self) -> String {
        if let Some(hash) = self.annotations.get(CONFIG_HASH_ANNOTATION) {
            return hash.clone();
        }

        let spec = serde_json::to_vec(&self.spec).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.uid.as_str().as_bytes());
        hasher.update(self.namespace.as_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(&spec);
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }

    /// Return the hash a mirror pod claims to mirror.
    #[must_use]
    pub fn mirror_hash(&self) -> Option<&str> {
        self.annotations
            .get(CONFIG_MIRROR_ANNOTATION)
            .map(String::as_str)
    }

    /// Sum the resource limits of every container.
    #[must_use]
    pub fn resource_request(&self) -> ResourceList {
        self.spec
            .containers
            .iter()
            .fold(ResourceList::default(), |acc, c| acc.saturating_add(&c.resources))
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.full_name(), self.uid)
    }
}

/// Build the `name_namespace` key for a pod.
#[must_use]
pub fn full_name(name: &str, namespace: &str) -> String {
    format!("{name}_{namespace}")
}

/// Split a `name_namespace` key back into its parts.
#[must_use]
pub fn parse_full_name(full_name: &str) -> Option<(&str, &str)> {
    let (name, namespace) = full_name.rsplit_once('_')?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }
    Some((name, namespace))
}

/// Desired state of a pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodSpec {
    /// Containers belonging to the pod.
    pub containers: Vec<Container>,
    /// What to do when a container exits.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Node labels the pod requires.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Volumes that containers may mount.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Maximum time the pod may be active on the node.
    #[serde(default)]
    pub active_deadline_seconds: Option<i64>,
    /// Names of secrets used to pull images.
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    /// Whether the pod shares the host network namespace.
    #[serde(default)]
    pub host_network: bool,
}

impl PodSpec {
    /// Return true if any container requests privileged mode.
    #[must_use]
    pub fn has_privileged_container(&self) -> bool {
        self.containers.iter().any(|c| c.privileged)
    }
}

/// A single container in a pod.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Container {
    /// Name, unique within the pod.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Ports exposed by the container.
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceList,
    /// Whether the container runs privileged.
    #[serde(default)]
    pub privileged: bool,
}

/// A port exposed by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContainerPort {
    /// Port inside the container.
    pub container_port: u16,
    /// Port claimed on the host; zero means none.
    #[serde(default)]
    pub host_port: u16,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

/// Transport protocol of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Restart policy applied to every container in a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Always restart exited containers.
    #[default]
    Always,
    /// Restart only containers that exited with a failure.
    OnFailure,
    /// Never restart.
    Never,
}

/// A volume declared by a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Name, unique within the pod.
    pub name: String,
    /// Where the volume comes from.
    pub source: VolumeSource,
}

/// Backing source of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    /// A scratch directory that lives as long as the pod.
    EmptyDir,
    /// A directory on the host.
    HostPath {
        /// Path on the host.
        path: String,
    },
}

impl VolumeSource {
    /// Name of the plugin handling this source.
    #[must_use]
    pub const fn plugin_name(&self) -> &'static str {
        match self {
            Self::EmptyDir => "empty-dir",
            Self::HostPath { .. } => "host-path",
        }
    }
}

/// Compute and memory quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceList {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu_millicores: u64,
    /// Memory in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Maximum number of pods; only meaningful for node capacity.
    #[serde(default)]
    pub pods: u64,
}

impl ResourceList {
    /// Add two resource lists, saturating on overflow.
    #[must_use]
    pub const fn saturating_add(&self, other: &Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.saturating_add(other.cpu_millicores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            pods: self.pods.saturating_add(other.pods),
        }
    }
}

/// A secret fetched from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Secret {
    /// Namespace of the secret.
    pub namespace: String,
    /// Name of the secret.
    pub name: String,
    /// Secret payload.
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}
