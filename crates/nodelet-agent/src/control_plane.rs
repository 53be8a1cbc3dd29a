//! The cluster control plane boundary.
//!
//! The agent talks to the control plane to register its node, report node and
//! pod status, manage mirror pods and resolve image pull secrets.

use async_trait::async_trait;
use nodelet_core::{Node, Pod, PodStatus, Secret};
use tracing::debug;

use crate::{AgentError, Result};

/// Operations the agent needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create the node record.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::AlreadyExists`] if a record with the same name
    /// exists, or another error if the request fails.
    async fn create_node(&self, node: &Node) -> Result<Node>;

    /// Fetch a node record by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Replace the status of a node record.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn update_node_status(&self, node: &Node) -> Result<Node>;

    /// Create a mirror pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn create_mirror_pod(&self, pod: &Pod) -> Result<()>;

    /// Delete a mirror pod. Deleting a missing pod succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn delete_mirror_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Publish the status of a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn update_pod_status(&self, pod: &Pod, status: &PodStatus) -> Result<()>;

    /// Fetch a secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is missing or the request fails.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
}

/// A control plane for nodes running without a cluster.
///
/// Writes are accepted and dropped; there are no node records or secrets.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneControlPlane;

#[async_trait]
impl ControlPlane for StandaloneControlPlane {
    async fn create_node(&self, node: &Node) -> Result<Node> {
        Ok(node.clone())
    }

    async fn get_node(&self, _name: &str) -> Result<Option<Node>> {
        Ok(None)
    }

    async fn update_node_status(&self, node: &Node) -> Result<Node> {
        Ok(node.clone())
    }

    async fn create_mirror_pod(&self, pod: &Pod) -> Result<()> {
        debug!(pod = %pod.full_name(), "Standalone mode, not creating mirror pod");
        Ok(())
    }

    async fn delete_mirror_pod(&self, _namespace: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn update_pod_status(&self, pod: &Pod, status: &PodStatus) -> Result<()> {
        debug!(
            pod = %pod.full_name(),
            phase = status.phase.as_str(),
            "Standalone mode, dropping pod status"
        );
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        Err(AgentError::ControlPlane(format!(
            "secret {namespace}/{name} unavailable in standalone mode"
        )))
    }
}

/// A mock control plane for testing without a real cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use nodelet_core::full_name;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// A control plane that stores everything in memory.
    #[derive(Default)]
    pub struct MockControlPlane {
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        nodes: HashMap<String, Node>,
        mirror_pods: HashMap<String, Pod>,
        pod_statuses: HashMap<String, PodStatus>,
        secrets: HashMap<(String, String), Secret>,
        fail_create_node: usize,
        fail_update_node: usize,
        fail_mirror_delete: bool,
        create_node_calls: usize,
        update_node_calls: usize,
        pod_status_updates: usize,
        mirror_creates: usize,
        mirror_deletes: Vec<String>,
    }

    impl MockControlPlane {
        /// Create an empty mock control plane.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Store a node record directly.
        pub fn insert_node(&self, node: Node) {
            self.state.lock().nodes.insert(node.name.clone(), node);
        }

        /// Return a stored node record.
        #[must_use]
        pub fn node(&self, name: &str) -> Option<Node> {
            self.state.lock().nodes.get(name).cloned()
        }

        /// Store a secret.
        pub fn insert_secret(&self, secret: Secret) {
            self.state
                .lock()
                .secrets
                .insert((secret.namespace.clone(), secret.name.clone()), secret);
        }

        /// Fail the next `n` node creations.
        pub fn fail_create_node(&self, n: usize) {
            self.state.lock().fail_create_node = n;
        }

        /// Fail the next `n` node status updates.
        pub fn fail_update_node(&self, n: usize) {
            self.state.lock().fail_update_node = n;
        }

        /// Make mirror pod deletion fail.
        pub fn fail_mirror_delete(&self, fail: bool) {
            self.state.lock().fail_mirror_delete = fail;
        }

        /// Number of `create_node` calls.
        #[must_use]
        pub fn create_node_calls(&self) -> usize {
            self.state.lock().create_node_calls
        }

        /// Number of `update_node_status` calls.
        #[must_use]
        pub fn update_node_calls(&self) -> usize {
            self.state.lock().update_node_calls
        }

        /// Return the stored mirror pod with a full name.
        #[must_use]
        pub fn mirror_pod(&self, full_name: &str) -> Option<Pod> {
            self.state.lock().mirror_pods.get(full_name).cloned()
        }

        /// Number of mirror pod creations.
        #[must_use]
        pub fn mirror_creates(&self) -> usize {
            self.state.lock().mirror_creates
        }

        /// Full names passed to `delete_mirror_pod`, in call order.
        #[must_use]
        pub fn mirror_deletes(&self) -> Vec<String> {
            self.state.lock().mirror_deletes.clone()
        }

        /// Return the last published status of a pod.
        #[must_use]
        pub fn pod_status(&self, full_name: &str) -> Option<PodStatus> {
            self.state.lock().pod_statuses.get(full_name).cloned()
        }

        /// Number of pod status updates.
        #[must_use]
        pub fn pod_status_updates(&self) -> usize {
            self.state.lock().pod_status_updates
        }
    }

    #[async_trait]
    impl ControlPlane for MockControlPlane {
        async fn create_node(&self, node: &Node) -> Result<Node> {
            let mut state = self.state.lock();
            state.create_node_calls += 1;
            if state.fail_create_node > 0 {
                state.fail_create_node -= 1;
                return Err(AgentError::ControlPlane("injected create failure".into()));
            }
            if state.nodes.contains_key(&node.name) {
                return Err(AgentError::AlreadyExists(node.name.clone()));
            }
            state.nodes.insert(node.name.clone(), node.clone());
            Ok(node.clone())
        }

        async fn get_node(&self, name: &str) -> Result<Option<Node>> {
            Ok(self.state.lock().nodes.get(name).cloned())
        }

        async fn update_node_status(&self, node: &Node) -> Result<Node> {
            let mut state = self.state.lock();
            state.update_node_calls += 1;
            if state.fail_update_node > 0 {
                state.fail_update_node -= 1;
                return Err(AgentError::ControlPlane("injected update failure".into()));
            }
            let Some(stored) = state.nodes.get_mut(&node.name) else {
                return Err(AgentError::ControlPlane(format!(
                    "node {} not found",
                    node.name
                )));
            };
            stored.status = node.status.clone();
            Ok(stored.clone())
        }

        async fn create_mirror_pod(&self, pod: &Pod) -> Result<()> {
            let mut state = self.state.lock();
            state.mirror_creates += 1;
            state.mirror_pods.insert(pod.full_name(), pod.clone());
            Ok(())
        }

        async fn delete_mirror_pod(&self, namespace: &str, name: &str) -> Result<()> {
            let mut state = self.state.lock();
            let key = full_name(name, namespace);
            state.mirror_deletes.push(key.clone());
            if state.fail_mirror_delete {
                return Err(AgentError::ControlPlane("injected delete failure".into()));
            }
            state.mirror_pods.remove(&key);
            Ok(())
        }

        async fn update_pod_status(&self, pod: &Pod, status: &PodStatus) -> Result<()> {
            let mut state = self.state.lock();
            state.pod_status_updates += 1;
            state.pod_statuses.insert(pod.full_name(), status.clone());
            Ok(())
        }

        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
            self.state
                .lock()
                .secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| AgentError::ControlPlane(format!("secret {namespace}/{name} not found")))
        }
    }
}
