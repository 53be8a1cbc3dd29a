//! Latest known node record.

use std::net::IpAddr;

use nodelet_core::{Node, NodeAddressType};
use parking_lot::RwLock;

use crate::{AgentError, Result};

/// Holds the node record most recently seen by the status reporter.
#[derive(Debug, Default)]
pub struct NodeCache {
    node: RwLock<Option<Node>>,
}

impl NodeCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached node.
    pub fn set(&self, node: Node) {
        *self.node.write() = Some(node);
    }

    /// Return the cached node.
    ///
    /// # Errors
    ///
    /// Returns an error if no node has been seen yet.
    pub fn get(&self) -> Result<Node> {
        self.node
            .read()
            .clone()
            .ok_or_else(|| AgentError::ControlPlane("node record not yet known".to_string()))
    }

    /// Return the IP the node is reached at.
    ///
    /// Prefers the legacy host IP, then the internal IP, then the external IP.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or has no parseable address.
    pub fn host_ip(&self) -> Result<IpAddr> {
        let node = self.get()?;
        for kind in [
            NodeAddressType::LegacyHostIP,
            NodeAddressType::InternalIP,
            NodeAddressType::ExternalIP,
        ] {
            if let Some(addr) = node
                .status
                .addresses
                .iter()
                .find(|a| a.address_type == kind)
            {
                return addr.address.parse().map_err(|_| {
                    AgentError::ControlPlane(format!("invalid node address {}", addr.address))
                });
            }
        }
        Err(AgentError::ControlPlane(format!(
            "host IP unknown; known addresses: {:?}",
            node.status.addresses
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelet_core::NodeAddress;

    fn node_with(addresses: Vec<(NodeAddressType, &str)>) -> Node {
        let mut node = Node {
            name: "node-1".into(),
            ..Default::default()
        };
        node.status.addresses = addresses
            .into_iter()
            .map(|(address_type, address)| NodeAddress {
                address_type,
                address: address.to_string(),
            })
            .collect();
        node
    }

    #[test]
    fn unknown_node_has_no_ip() {
        assert!(NodeCache::new().host_ip().is_err());
    }

    #[test]
    fn host_ip_precedence() {
        let cache = NodeCache::new();
        cache.set(node_with(vec![
            (NodeAddressType::ExternalIP, "203.0.113.9"),
            (NodeAddressType::InternalIP, "10.0.0.9"),
        ]));
        assert_eq!(cache.host_ip().unwrap().to_string(), "10.0.0.9");

        cache.set(node_with(vec![
            (NodeAddressType::InternalIP, "10.0.0.9"),
            (NodeAddressType::LegacyHostIP, "192.168.1.9"),
        ]));
        assert_eq!(cache.host_ip().unwrap().to_string(), "192.168.1.9");

        cache.set(node_with(vec![(NodeAddressType::ExternalIP, "203.0.113.9")]));
        assert_eq!(cache.host_ip().unwrap().to_string(), "203.0.113.9");

        cache.set(node_with(Vec::new()));
        assert!(cache.host_ip().is_err());
    }
}
