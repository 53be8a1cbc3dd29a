//! Node record types reported to the control plane.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pod::ResourceList;
use crate::status::ConditionStatus;

/// The control-plane record describing this node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Node {
    /// Node name, normally the hostname.
    pub name: String,
    /// Labels used by node selectors.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Identity used to recognise an existing registration.
    pub external_id: String,
    /// Pod CIDR assigned to the node, if any.
    #[serde(default)]
    pub pod_cidr: Option<String>,
    /// Whether new pods may be scheduled here.
    #[serde(default)]
    pub unschedulable: bool,
    /// Reported status.
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    /// Return the Ready condition, if present.
    #[must_use]
    pub fn ready_condition(&self) -> Option<&NodeCondition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == NodeConditionType::Ready)
    }
}

/// Status section of a node record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Addresses the node is reachable at.
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    /// Total resources.
    #[serde(default)]
    pub capacity: ResourceList,
    /// Health conditions.
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
    /// Software and hardware identity.
    #[serde(default)]
    pub node_info: NodeSystemInfo,
}

/// An address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Kind of address.
    pub address_type: NodeAddressType,
    /// The address itself.
    pub address: String,
}

/// Kinds of node address, in lookup precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeAddressType {
    /// Address derived from the hostname.
    LegacyHostIP,
    /// Cluster-internal address.
    InternalIP,
    /// Externally routable address.
    ExternalIP,
}

impl NodeAddressType {
    /// Return the canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LegacyHostIP => "LegacyHostIP",
            Self::InternalIP => "InternalIP",
            Self::ExternalIP => "ExternalIP",
        }
    }
}

/// A node health condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    /// What the condition describes.
    pub condition_type: NodeConditionType,
    /// Whether it holds.
    pub status: ConditionStatus,
    /// Why, in words.
    pub reason: String,
    /// Last time the agent reported this condition.
    pub last_heartbeat_time: DateTime<Utc>,
    /// Last time `status` changed value.
    pub last_transition_time: DateTime<Utc>,
}

/// Kinds of node condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeConditionType {
    /// The node can run pods.
    Ready,
}

/// Identity of the node's hardware and software.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSystemInfo {
    /// Machine ID.
    #[serde(default)]
    pub machine_id: String,
    /// System UUID.
    #[serde(default)]
    pub system_uuid: String,
    /// Boot ID; changes on every reboot.
    #[serde(default)]
    pub boot_id: String,
    /// Container runtime version, as `<kind>://<version>`.
    #[serde(default)]
    pub container_runtime_version: String,
    /// Agent version.
    #[serde(default)]
    pub agent_version: String,
}

/// Machine facts gathered once and cached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Number of logical CPUs.
    pub num_cores: u64,
    /// Memory in bytes.
    pub memory_capacity: u64,
    /// Machine ID.
    #[serde(default)]
    pub machine_id: String,
    /// System UUID.
    #[serde(default)]
    pub system_uuid: String,
    /// Boot ID.
    #[serde(default)]
    pub boot_id: String,
}

impl MachineInfo {
    /// Derive the node capacity from machine facts.
    #[must_use]
    pub const fn capacity(&self, max_pods: u64) -> ResourceList {
        ResourceList {
            cpu_millicores: self.num_cores.saturating_mul(1000),
            memory_bytes: self.memory_capacity,
            pods: max_pods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_from_machine_info() {
        let info = MachineInfo {
            num_cores: 4,
            memory_capacity: 8 << 30,
            ..Default::default()
        };
        let capacity = info.capacity(40);
        assert_eq!(capacity.cpu_millicores, 4000);
        assert_eq!(capacity.memory_bytes, 8 << 30);
        assert_eq!(capacity.pods, 40);
    }

    #[test]
    fn address_precedence_order() {
        assert!(NodeAddressType::LegacyHostIP < NodeAddressType::InternalIP);
        assert!(NodeAddressType::InternalIP < NodeAddressType::ExternalIP);
    }
}
