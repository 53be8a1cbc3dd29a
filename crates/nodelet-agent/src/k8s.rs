//! Kubernetes control plane implementation.
//!
//! This module provides the pieces that connect the agent to a real
//! cluster through `kube`:
//!
//! - [`KubeControlPlane`]: node registration, node and pod status, mirror
//!   pods and pull secrets
//! - [`KubeEventRecorder`]: posts agent events as `v1.Event` objects
//! - [`ApiSource`]: watches the pods bound to this node and feeds them to
//!   the main loop
//!
//! Conversions between the API objects and the agent's own types live at the
//! bottom of the file.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1 as api;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, watcher, Config as WatcherConfig};
use kube::Client;
use nodelet_core::{
    ConditionStatus, Container, ContainerId, ContainerPort, ContainerState, ContainerStatus,
    CoreError, Node, NodeAddress, NodeAddressType, NodeCondition, NodeConditionType, NodeStatus,
    NodeSystemInfo, Pod, PodConditionType, PodPhase, PodSpec, PodStatus, PodUid, Protocol,
    ResourceList, RestartPolicy, Secret, Termination, Volume, VolumeSource, API_SOURCE,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::control_plane::ControlPlane;
use crate::events::{EventRecorder, EventType, ObjectRef};
use crate::update::PodUpdate;
use crate::{AgentError, Result};

const COMPONENT: &str = "nodelet";

/// Control plane backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
    node_name: String,
}

impl KubeControlPlane {
    /// Create a control plane for the node `node_name`.
    #[must_use]
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    fn nodes_api(&self) -> Api<api::Node> {
        Api::all(self.client.clone())
    }

    fn pods_api(&self, namespace: &str) -> Api<api::Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn create_node(&self, node: &Node) -> Result<Node> {
        match self
            .nodes_api()
            .create(&PostParams::default(), &node_to_k8s(node))
            .await
        {
            Ok(created) => {
                info!(node = %node.name, "Created node record");
                node_from_k8s(&created)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(AgentError::AlreadyExists(node.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.nodes_api()
            .get_opt(name)
            .await?
            .as_ref()
            .map(node_from_k8s)
            .transpose()
    }

    async fn update_node_status(&self, node: &Node) -> Result<Node> {
        let status = node_status_to_k8s(&node.status);
        let patch = Patch::Merge(json!({ "status": status }));
        let updated = self
            .nodes_api()
            .patch_status(&node.name, &PatchParams::default(), &patch)
            .await?;
        node_from_k8s(&updated)
    }

    async fn create_mirror_pod(&self, pod: &Pod) -> Result<()> {
        match self
            .pods_api(&pod.namespace)
            .create(&PostParams::default(), &pod_to_k8s(pod, &self.node_name))
            .await
        {
            Ok(_) => {
                debug!(pod = %pod.full_name(), "Created mirror pod");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(AgentError::AlreadyExists(pod.full_name()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_mirror_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .pods_api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(namespace, name, "Deleted mirror pod");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, name, "Mirror pod not found, already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_pod_status(&self, pod: &Pod, status: &PodStatus) -> Result<()> {
        let patch = Patch::Merge(json!({ "status": pod_status_to_k8s(status) }));
        match self
            .pods_api(&pod.namespace)
            .patch_status(&pod.name, &PatchParams::default(), &patch)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(pod = %pod.full_name(), "Pod gone, dropping status update");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let secrets: Api<api::Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(name).await?;
        Ok(secret_from_k8s(&secret, namespace, name))
    }
}

/// Event recorder that posts `v1.Event` objects.
///
/// Posting happens on a spawned task; failures are logged and dropped.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    host: String,
    node_namespace: String,
}

impl KubeEventRecorder {
    /// Create a recorder reporting from `host`.
    ///
    /// Events about the node itself go to `node_namespace`.
    #[must_use]
    pub fn new(client: Client, host: impl Into<String>, node_namespace: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into(),
            node_namespace: node_namespace.into(),
        }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        let namespace = if object.namespace.is_empty() {
            self.node_namespace.clone()
        } else {
            object.namespace.clone()
        };
        let event = build_event(object, &namespace, &self.host, event_type, reason, message);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(reason, "No async runtime, dropping event");
            return;
        };
        let events: Api<api::Event> = Api::namespaced(self.client.clone(), &namespace);
        let reason = reason.to_string();
        handle.spawn(async move {
            if let Err(e) = events.create(&PostParams::default(), &event).await {
                warn!(reason, error = %e, "Failed to record event");
            }
        });
    }
}

/// Watches the pods bound to this node.
pub struct ApiSource {
    client: Client,
    node_name: String,
}

impl ApiSource {
    /// Create a source for pods bound to `node_name`.
    #[must_use]
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    /// Deliver the full pod set on every change until the receiver closes.
    ///
    /// Nothing is sent until the initial listing completes, so the first
    /// update is a complete view of the node's pods.
    pub async fn run(self, tx: mpsc::Sender<PodUpdate>) {
        let pods: Api<api::Pod> = Api::all(self.client.clone());
        let config = WatcherConfig::default().fields(&format!("spec.nodeName={}", self.node_name));
        let watch = watcher(pods, config);

        futures::pin_mut!(watch);

        info!(node = %self.node_name, "Starting API pod watch");

        let mut store: HashMap<String, Pod> = HashMap::new();
        let mut initial: HashMap<String, Pod> = HashMap::new();
        let mut synced = false;

        while let Some(event) = watch.next().await {
            let changed = match event {
                Ok(watcher::Event::Init) => {
                    initial.clear();
                    false
                }
                Ok(watcher::Event::InitApply(pod)) => {
                    if let Some(pod) = convert_watched(&pod) {
                        initial.insert(pod.uid.to_string(), pod);
                    }
                    false
                }
                Ok(watcher::Event::InitDone) => {
                    store = std::mem::take(&mut initial);
                    synced = true;
                    info!(pods = store.len(), "Initial pod listing complete");
                    true
                }
                Ok(watcher::Event::Apply(pod)) => match convert_watched(&pod) {
                    Some(pod) => {
                        store.insert(pod.uid.to_string(), pod);
                        true
                    }
                    None => false,
                },
                Ok(watcher::Event::Delete(pod)) => pod
                    .metadata
                    .uid
                    .as_ref()
                    .is_some_and(|uid| store.remove(uid).is_some()),
                Err(e) => {
                    error!(error = %e, "Pod watch error, will retry");
                    false
                }
            };

            if changed && synced {
                let pods: Vec<Pod> = store.values().cloned().collect();
                if tx.send(PodUpdate::set(API_SOURCE, pods)).await.is_err() {
                    debug!("Pod update receiver closed, stopping API watch");
                    return;
                }
            }
        }

        warn!("API pod watch exited unexpectedly");
    }
}

fn convert_watched(pod: &api::Pod) -> Option<Pod> {
    match pod_from_k8s(pod) {
        Ok(pod) => Some(pod),
        Err(e) => {
            warn!(
                name = pod.metadata.name.as_deref().unwrap_or("unknown"),
                error = %e,
                "Skipping pod that cannot be converted"
            );
            None
        }
    }
}

// Conversions

/// Convert an API pod into the agent's pod.
///
/// # Errors
///
/// Returns an error if the pod has no UID or name.
pub fn pod_from_k8s(pod: &api::Pod) -> Result<Pod> {
    let meta = &pod.metadata;
    let uid = meta
        .uid
        .as_deref()
        .ok_or_else(|| AgentError::ControlPlane("pod without uid".to_string()))?;
    let uid = PodUid::new(uid).map_err(CoreError::from)?;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| AgentError::ControlPlane(format!("pod {uid} without name")))?;

    let spec = pod.spec.as_ref().map(spec_from_k8s).unwrap_or_default();
    let status = pod
        .status
        .as_ref()
        .map(pod_status_from_k8s)
        .unwrap_or_default();

    Ok(Pod {
        uid,
        namespace: meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        name,
        creation_timestamp: meta
            .creation_timestamp
            .as_ref()
            .map_or_else(Utc::now, |t| t.0),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        spec,
        status,
    })
}

fn spec_from_k8s(spec: &api::PodSpec) -> PodSpec {
    PodSpec {
        containers: spec.containers.iter().map(container_from_k8s).collect(),
        restart_policy: match spec.restart_policy.as_deref() {
            Some("OnFailure") => RestartPolicy::OnFailure,
            Some("Never") => RestartPolicy::Never,
            _ => RestartPolicy::Always,
        },
        node_selector: spec.node_selector.clone().unwrap_or_default(),
        volumes: spec
            .volumes
            .iter()
            .flatten()
            .filter_map(volume_from_k8s)
            .collect(),
        active_deadline_seconds: spec.active_deadline_seconds,
        image_pull_secrets: spec
            .image_pull_secrets
            .iter()
            .flatten()
            .map(|s| s.name.clone())
            .collect(),
        host_network: spec.host_network.unwrap_or(false),
    }
}

fn container_from_k8s(c: &api::Container) -> Container {
    let limits = c.resources.as_ref().and_then(|r| r.limits.as_ref());
    Container {
        name: c.name.clone(),
        image: c.image.clone().unwrap_or_default(),
        ports: c
            .ports
            .iter()
            .flatten()
            .map(|p| ContainerPort {
                container_port: u16::try_from(p.container_port).unwrap_or(0),
                host_port: p
                    .host_port
                    .and_then(|h| u16::try_from(h).ok())
                    .unwrap_or(0),
                protocol: match p.protocol.as_deref() {
                    Some("UDP") => Protocol::Udp,
                    _ => Protocol::Tcp,
                },
            })
            .collect(),
        resources: ResourceList {
            cpu_millicores: limits
                .and_then(|l| l.get("cpu"))
                .and_then(|q| parse_cpu_millis(&q.0))
                .unwrap_or(0),
            memory_bytes: limits
                .and_then(|l| l.get("memory"))
                .and_then(|q| parse_bytes(&q.0))
                .unwrap_or(0),
            pods: 0,
        },
        privileged: c
            .security_context
            .as_ref()
            .and_then(|s| s.privileged)
            .unwrap_or(false),
    }
}

fn volume_from_k8s(v: &api::Volume) -> Option<Volume> {
    let source = if v.empty_dir.is_some() {
        VolumeSource::EmptyDir
    } else if let Some(host) = &v.host_path {
        VolumeSource::HostPath {
            path: host.path.clone(),
        }
    } else {
        debug!(volume = %v.name, "Ignoring volume with unsupported source");
        return None;
    };
    Some(Volume {
        name: v.name.clone(),
        source,
    })
}

fn pod_status_from_k8s(status: &api::PodStatus) -> PodStatus {
    PodStatus {
        phase: match status.phase.as_deref() {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        },
        message: status.message.clone(),
        start_time: status.start_time.as_ref().map(|t| t.0),
        host_ip: status.host_ip.as_deref().and_then(|ip| ip.parse().ok()),
        ..Default::default()
    }
}

/// Convert a pod into an API pod bound to `node_name`.
///
/// The UID is left for the API server to assign.
#[must_use]
pub fn pod_to_k8s(pod: &Pod, node_name: &str) -> api::Pod {
    let spec = &pod.spec;
    api::Pod {
        metadata: ObjectMeta {
            name: Some(pod.name.clone()),
            namespace: Some(pod.namespace.clone()),
            labels: Some(pod.labels.clone()),
            annotations: Some(pod.annotations.clone()),
            ..Default::default()
        },
        spec: Some(api::PodSpec {
            node_name: Some(node_name.to_string()),
            containers: spec.containers.iter().map(container_to_k8s).collect(),
            restart_policy: Some(
                match spec.restart_policy {
                    RestartPolicy::Always => "Always",
                    RestartPolicy::OnFailure => "OnFailure",
                    RestartPolicy::Never => "Never",
                }
                .to_string(),
            ),
            node_selector: (!spec.node_selector.is_empty()).then(|| spec.node_selector.clone()),
            volumes: Some(spec.volumes.iter().map(volume_to_k8s).collect()),
            active_deadline_seconds: spec.active_deadline_seconds,
            image_pull_secrets: Some(
                spec.image_pull_secrets
                    .iter()
                    .map(|name| api::LocalObjectReference { name: name.clone() })
                    .collect(),
            ),
            host_network: Some(spec.host_network),
            ..Default::default()
        }),
        status: None,
    }
}

fn container_to_k8s(c: &Container) -> api::Container {
    let mut limits = BTreeMap::new();
    if c.resources.cpu_millicores > 0 {
        limits.insert("cpu".to_string(), cpu_quantity(c.resources.cpu_millicores));
    }
    if c.resources.memory_bytes > 0 {
        limits.insert(
            "memory".to_string(),
            Quantity(c.resources.memory_bytes.to_string()),
        );
    }
    api::Container {
        name: c.name.clone(),
        image: Some(c.image.clone()),
        ports: Some(
            c.ports
                .iter()
                .map(|p| api::ContainerPort {
                    container_port: i32::from(p.container_port),
                    host_port: (p.host_port != 0).then_some(i32::from(p.host_port)),
                    protocol: Some(p.protocol.to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        resources: (!limits.is_empty()).then(|| api::ResourceRequirements {
            limits: Some(limits),
            ..Default::default()
        }),
        security_context: c.privileged.then(|| api::SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_to_k8s(v: &Volume) -> api::Volume {
    let mut out = api::Volume {
        name: v.name.clone(),
        ..Default::default()
    };
    match &v.source {
        VolumeSource::EmptyDir => out.empty_dir = Some(api::EmptyDirVolumeSource::default()),
        VolumeSource::HostPath { path } => {
            out.host_path = Some(api::HostPathVolumeSource {
                path: path.clone(),
                ..Default::default()
            });
        }
    }
    out
}

/// Convert a pod status into its API form.
#[must_use]
pub fn pod_status_to_k8s(status: &PodStatus) -> api::PodStatus {
    api::PodStatus {
        phase: Some(status.phase.as_str().to_string()),
        message: status.message.clone(),
        conditions: Some(
            status
                .conditions
                .iter()
                .map(|c| api::PodCondition {
                    type_: match c.condition_type {
                        PodConditionType::Ready => "Ready".to_string(),
                    },
                    status: c.status.as_str().to_string(),
                    ..Default::default()
                })
                .collect(),
        ),
        container_statuses: Some(
            status
                .container_statuses
                .iter()
                .map(container_status_to_k8s)
                .collect(),
        ),
        host_ip: status.host_ip.map(|ip| ip.to_string()),
        start_time: status.start_time.map(Time),
        ..Default::default()
    }
}

fn container_status_to_k8s(cs: &ContainerStatus) -> api::ContainerStatus {
    api::ContainerStatus {
        name: cs.name.clone(),
        container_id: cs.container_id.as_ref().map(ToString::to_string),
        image: cs.image.clone(),
        ready: cs.ready,
        restart_count: i32::try_from(cs.restart_count).unwrap_or(i32::MAX),
        state: Some(container_state_to_k8s(&cs.state)),
        last_state: cs
            .last_termination
            .as_ref()
            .map(|t| container_state_to_k8s(&ContainerState::Terminated(t.clone()))),
        ..Default::default()
    }
}

fn container_state_to_k8s(state: &ContainerState) -> api::ContainerState {
    match state {
        ContainerState::Waiting { reason } => api::ContainerState {
            waiting: Some(api::ContainerStateWaiting {
                reason: reason.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ContainerState::Running { started_at } => api::ContainerState {
            running: Some(api::ContainerStateRunning {
                started_at: started_at.map(Time),
            }),
            ..Default::default()
        },
        ContainerState::Terminated(Termination {
            exit_code,
            reason,
            container_id,
            finished_at,
        }) => api::ContainerState {
            terminated: Some(api::ContainerStateTerminated {
                exit_code: *exit_code,
                reason: reason.clone(),
                container_id: container_id.as_ref().map(ContainerId::to_string),
                finished_at: finished_at.map(Time),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

/// Convert an API node into the agent's node record.
///
/// # Errors
///
/// Returns an error if the node has no name.
pub fn node_from_k8s(node: &api::Node) -> Result<Node> {
    let name = node
        .metadata
        .name
        .clone()
        .ok_or_else(|| AgentError::ControlPlane("node without name".to_string()))?;
    let spec = node.spec.as_ref();
    let status = node.status.as_ref();

    let capacity = status.and_then(|s| s.capacity.as_ref());
    let node_info = status.and_then(|s| s.node_info.as_ref());

    Ok(Node {
        external_id: spec
            .and_then(|s| s.external_id.clone())
            .unwrap_or_else(|| name.clone()),
        name,
        labels: node.metadata.labels.clone().unwrap_or_default(),
        pod_cidr: spec.and_then(|s| s.pod_cidr.clone()),
        unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
        status: NodeStatus {
            addresses: status
                .and_then(|s| s.addresses.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|a| {
                    let address_type = match a.type_.as_str() {
                        "LegacyHostIP" => NodeAddressType::LegacyHostIP,
                        "InternalIP" => NodeAddressType::InternalIP,
                        "ExternalIP" => NodeAddressType::ExternalIP,
                        _ => return None,
                    };
                    Some(NodeAddress {
                        address_type,
                        address: a.address.clone(),
                    })
                })
                .collect(),
            capacity: ResourceList {
                cpu_millicores: capacity
                    .and_then(|c| c.get("cpu"))
                    .and_then(|q| parse_cpu_millis(&q.0))
                    .unwrap_or(0),
                memory_bytes: capacity
                    .and_then(|c| c.get("memory"))
                    .and_then(|q| parse_bytes(&q.0))
                    .unwrap_or(0),
                pods: capacity
                    .and_then(|c| c.get("pods"))
                    .and_then(|q| q.0.parse().ok())
                    .unwrap_or(0),
            },
            conditions: status
                .and_then(|s| s.conditions.as_ref())
                .into_iter()
                .flatten()
                .filter(|c| c.type_ == "Ready")
                .map(|c| {
                    let now = Utc::now();
                    NodeCondition {
                        condition_type: NodeConditionType::Ready,
                        status: condition_status_from_str(&c.status),
                        reason: c.reason.clone().unwrap_or_default(),
                        last_heartbeat_time: c.last_heartbeat_time.as_ref().map_or(now, |t| t.0),
                        last_transition_time: c
                            .last_transition_time
                            .as_ref()
                            .map_or(now, |t| t.0),
                    }
                })
                .collect(),
            node_info: node_info.map_or_else(NodeSystemInfo::default, |i| NodeSystemInfo {
                machine_id: i.machine_id.clone(),
                system_uuid: i.system_uuid.clone(),
                boot_id: i.boot_id.clone(),
                container_runtime_version: i.container_runtime_version.clone(),
                agent_version: i.kubelet_version.clone(),
            }),
        },
    })
}

/// Convert the agent's node record into an API node.
#[must_use]
pub fn node_to_k8s(node: &Node) -> api::Node {
    api::Node {
        metadata: ObjectMeta {
            name: Some(node.name.clone()),
            labels: Some(node.labels.clone()),
            ..Default::default()
        },
        spec: Some(api::NodeSpec {
            external_id: Some(node.external_id.clone()),
            pod_cidr: node.pod_cidr.clone(),
            unschedulable: Some(node.unschedulable),
            ..Default::default()
        }),
        status: Some(node_status_to_k8s(&node.status)),
    }
}

fn node_status_to_k8s(status: &NodeStatus) -> api::NodeStatus {
    let capacity = BTreeMap::from([
        (
            "cpu".to_string(),
            cpu_quantity(status.capacity.cpu_millicores),
        ),
        (
            "memory".to_string(),
            Quantity(status.capacity.memory_bytes.to_string()),
        ),
        ("pods".to_string(), Quantity(status.capacity.pods.to_string())),
    ]);
    let info = &status.node_info;
    api::NodeStatus {
        addresses: Some(
            status
                .addresses
                .iter()
                .map(|a| api::NodeAddress {
                    type_: a.address_type.as_str().to_string(),
                    address: a.address.clone(),
                })
                .collect(),
        ),
        capacity: Some(capacity),
        conditions: Some(
            status
                .conditions
                .iter()
                .map(|c| api::NodeCondition {
                    type_: "Ready".to_string(),
                    status: c.status.as_str().to_string(),
                    reason: Some(c.reason.clone()),
                    last_heartbeat_time: Some(Time(c.last_heartbeat_time)),
                    last_transition_time: Some(Time(c.last_transition_time)),
                    ..Default::default()
                })
                .collect(),
        ),
        node_info: Some(api::NodeSystemInfo {
            machine_id: info.machine_id.clone(),
            system_uuid: info.system_uuid.clone(),
            boot_id: info.boot_id.clone(),
            container_runtime_version: info.container_runtime_version.clone(),
            kubelet_version: info.agent_version.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_from_k8s(secret: &api::Secret, namespace: &str, name: &str) -> Secret {
    Secret {
        namespace: namespace.to_string(),
        name: name.to_string(),
        data: secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.0.clone()))
            .collect(),
    }
}

fn build_event(
    object: &ObjectRef,
    namespace: &str,
    host: &str,
    event_type: EventType,
    reason: &str,
    message: &str,
) -> api::Event {
    let now = Utc::now();
    let suffix = now.timestamp_nanos_opt().unwrap_or_default();
    api::Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{suffix:x}", object.name)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        involved_object: api::ObjectReference {
            kind: Some(object.kind.as_str().to_string()),
            namespace: (!object.namespace.is_empty()).then(|| object.namespace.clone()),
            name: Some(object.name.clone()),
            uid: object.uid.clone(),
            ..Default::default()
        },
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        type_: Some(event_type.as_str().to_string()),
        source: Some(api::EventSource {
            component: Some(COMPONENT.to_string()),
            host: Some(host.to_string()),
        }),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        count: Some(1),
        ..Default::default()
    }
}

fn condition_status_from_str(s: &str) -> ConditionStatus {
    match s {
        "True" => ConditionStatus::True,
        "False" => ConditionStatus::False,
        _ => ConditionStatus::Unknown,
    }
}

fn cpu_quantity(millis: u64) -> Quantity {
    if millis % 1000 == 0 {
        Quantity((millis / 1000).to_string())
    } else {
        Quantity(format!("{millis}m"))
    }
}

/// Parse a CPU quantity such as `500m`, `2` or `0.5` into millicores.
fn parse_cpu_millis(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(millis) = s.strip_suffix('m') {
        return millis.parse().ok();
    }
    match s.split_once('.') {
        Some((whole, frac)) => {
            let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
            let digits: String = frac.chars().take(3).collect();
            let scale = 10u64.pow(u32::try_from(3 - digits.len()).ok()?);
            let frac: u64 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
            whole.checked_mul(1000)?.checked_add(frac * scale)
        }
        None => s.parse::<u64>().ok()?.checked_mul(1000),
    }
}

/// Parse a memory quantity such as `128Mi`, `1G` or `1024` into bytes.
fn parse_bytes(s: &str) -> Option<u64> {
    const SUFFIXES: [(&str, u64); 12] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];
    let s = s.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(n) = s.strip_suffix(suffix) {
            return n.parse::<u64>().ok()?.checked_mul(factor);
        }
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use nodelet_core::PodCondition;

    fn api_pod() -> api::Pod {
        api::Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("prod".to_string()),
                uid: Some("uid-1".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            },
            spec: Some(api::PodSpec {
                containers: vec![api::Container {
                    name: "app".to_string(),
                    image: Some("nginx:1.25".to_string()),
                    ports: Some(vec![api::ContainerPort {
                        container_port: 80,
                        host_port: Some(8080),
                        protocol: Some("UDP".to_string()),
                        ..Default::default()
                    }]),
                    resources: Some(api::ResourceRequirements {
                        limits: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("250m".to_string())),
                            ("memory".to_string(), Quantity("64Mi".to_string())),
                        ])),
                        ..Default::default()
                    }),
                    security_context: Some(api::SecurityContext {
                        privileged: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                restart_policy: Some("OnFailure".to_string()),
                volumes: Some(vec![
                    api::Volume {
                        name: "scratch".to_string(),
                        empty_dir: Some(api::EmptyDirVolumeSource::default()),
                        ..Default::default()
                    },
                    api::Volume {
                        name: "logs".to_string(),
                        host_path: Some(api::HostPathVolumeSource {
                            path: "/var/log".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    api::Volume {
                        name: "config".to_string(),
                        config_map: Some(api::ConfigMapVolumeSource::default()),
                        ..Default::default()
                    },
                ]),
                image_pull_secrets: Some(vec![api::LocalObjectReference {
                    name: "registry".to_string(),
                }]),
                host_network: Some(true),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn converts_api_pod() {
        let pod = pod_from_k8s(&api_pod()).unwrap();
        assert_eq!(pod.full_name(), "web_prod");
        assert_eq!(pod.spec.restart_policy, RestartPolicy::OnFailure);
        assert!(pod.spec.host_network);
        assert_eq!(pod.spec.image_pull_secrets, vec!["registry".to_string()]);

        let c = &pod.spec.containers[0];
        assert_eq!(c.image, "nginx:1.25");
        assert!(c.privileged);
        assert_eq!(c.resources.cpu_millicores, 250);
        assert_eq!(c.resources.memory_bytes, 64 << 20);
        assert_eq!(
            c.ports[0],
            ContainerPort {
                container_port: 80,
                host_port: 8080,
                protocol: Protocol::Udp,
            }
        );

        // Unsupported volume sources are dropped.
        assert_eq!(pod.spec.volumes.len(), 2);
        assert_eq!(pod.spec.volumes[0].source, VolumeSource::EmptyDir);
        assert_eq!(
            pod.spec.volumes[1].source,
            VolumeSource::HostPath {
                path: "/var/log".to_string()
            }
        );
    }

    #[test]
    fn pod_without_uid_is_rejected() {
        let mut pod = api_pod();
        pod.metadata.uid = None;
        assert!(pod_from_k8s(&pod).is_err());
    }

    #[test]
    fn mirror_pod_is_bound_to_node() {
        let mut pod = pod_from_k8s(&api_pod()).unwrap();
        pod.annotations.insert(
            nodelet_core::CONFIG_MIRROR_ANNOTATION.to_string(),
            "abc".to_string(),
        );
        let out = pod_to_k8s(&pod, "node-1");
        assert!(out.metadata.uid.is_none());
        let spec = out.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-1"));
        assert_eq!(spec.containers[0].ports.as_ref().unwrap()[0].host_port, Some(8080));
        assert_eq!(
            out.metadata.annotations.unwrap()[nodelet_core::CONFIG_MIRROR_ANNOTATION],
            "abc"
        );
    }

    #[test]
    fn pod_status_maps_container_states() {
        let status = PodStatus {
            phase: PodPhase::Running,
            conditions: vec![PodCondition {
                condition_type: PodConditionType::Ready,
                status: ConditionStatus::True,
            }],
            container_statuses: vec![ContainerStatus {
                name: "app".to_string(),
                container_id: Some(ContainerId::new("docker://abc")),
                state: ContainerState::running(),
                last_termination: Some(Termination {
                    exit_code: 137,
                    ..Default::default()
                }),
                ready: true,
                restart_count: 2,
                image: "nginx".to_string(),
            }],
            host_ip: Some("10.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        let out = pod_status_to_k8s(&status);
        assert_eq!(out.phase.as_deref(), Some("Running"));
        assert_eq!(out.host_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(out.conditions.unwrap()[0].status, "True");

        let cs = &out.container_statuses.unwrap()[0];
        assert_eq!(cs.container_id.as_deref(), Some("docker://abc"));
        assert_eq!(cs.restart_count, 2);
        assert!(cs.state.as_ref().unwrap().running.is_some());
        let last = cs.last_state.as_ref().unwrap().terminated.as_ref().unwrap();
        assert_eq!(last.exit_code, 137);
    }

    #[test]
    fn node_conversion_keeps_status() {
        let now = Utc::now();
        let node = Node {
            name: "node-1".to_string(),
            labels: BTreeMap::from([("zone".to_string(), "a".to_string())]),
            external_id: "node-1".to_string(),
            pod_cidr: Some("10.1.0.0/24".to_string()),
            unschedulable: false,
            status: NodeStatus {
                addresses: vec![NodeAddress {
                    address_type: NodeAddressType::InternalIP,
                    address: "10.0.0.5".to_string(),
                }],
                capacity: ResourceList {
                    cpu_millicores: 4000,
                    memory_bytes: 8 << 30,
                    pods: 40,
                },
                conditions: vec![NodeCondition {
                    condition_type: NodeConditionType::Ready,
                    status: ConditionStatus::True,
                    reason: "ready".to_string(),
                    last_heartbeat_time: now,
                    last_transition_time: now,
                }],
                node_info: NodeSystemInfo {
                    boot_id: "boot-1".to_string(),
                    container_runtime_version: "memory://0.1.0".to_string(),
                    ..Default::default()
                },
            },
        };

        let api_node = node_to_k8s(&node);
        let capacity = api_node.status.as_ref().unwrap().capacity.as_ref().unwrap();
        assert_eq!(capacity["cpu"].0, "4");
        assert_eq!(capacity["pods"].0, "40");

        let back = node_from_k8s(&api_node).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn secret_data_is_copied() {
        let secret = api::Secret {
            data: Some(BTreeMap::from([(
                ".dockerconfigjson".to_string(),
                ByteString(b"{}".to_vec()),
            )])),
            ..Default::default()
        };
        let out = secret_from_k8s(&secret, "prod", "registry");
        assert_eq!(out.data[".dockerconfigjson"], b"{}".to_vec());
        assert_eq!(out.name, "registry");
    }

    #[test]
    fn events_reference_their_object() {
        let node_ref = ObjectRef::node("node-1");
        let event = build_event(
            &node_ref,
            "default",
            "node-1",
            EventType::Warning,
            "rebooted",
            "Node node-1 has been rebooted",
        );
        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.involved_object.kind.as_deref(), Some("Node"));
        assert!(event.involved_object.namespace.is_none());
        assert_eq!(event.metadata.namespace.as_deref(), Some("default"));
        assert!(event.metadata.name.unwrap().starts_with("node-1."));
        assert_eq!(event.source.unwrap().component.as_deref(), Some(COMPONENT));
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_cpu_millis("500m"), Some(500));
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis("1.25"), Some(1250));
        assert_eq!(parse_cpu_millis("lots"), None);
        assert_eq!(parse_cpu_millis("18446744073709551615"), None);
        assert_eq!(parse_cpu_millis("18446744073709551615.5"), None);

        assert_eq!(parse_bytes("128Mi"), Some(128 << 20));
        assert_eq!(parse_bytes("1G"), Some(1_000_000_000));
        assert_eq!(parse_bytes("2048"), Some(2048));
        assert_eq!(parse_bytes("1Xi"), None);

        assert_eq!(cpu_quantity(1500).0, "1500m");
        assert_eq!(cpu_quantity(3000).0, "3");
    }
}
