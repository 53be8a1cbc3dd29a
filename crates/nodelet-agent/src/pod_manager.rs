//! Desired pod store and mirror pod management.
//!
//! [`BasicPodManager`] holds the pods assigned to this node as delivered by
//! config sources. Mirror pods are kept apart from regular pods, keyed by full
//! name, so a static pod can find its mirror.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nodelet_core::{
    parse_full_name, Pod, PodUid, CONFIG_HASH_ANNOTATION, CONFIG_MIRROR_ANNOTATION,
    CONFIG_SOURCE_ANNOTATION,
};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::control_plane::ControlPlane;
use crate::error::AggregateError;
use crate::update::{PodUpdate, SyncPodType, SyncTypes, UpdateOp};
use crate::{AgentError, Result};

/// Stores desired pods and manages their mirrors.
pub struct BasicPodManager {
    state: RwLock<PodState>,
    control_plane: Arc<dyn ControlPlane>,
}

#[derive(Default)]
struct PodState {
    pods: Vec<Pod>,
    mirrors_by_full_name: HashMap<String, Pod>,
}

impl PodState {
    fn set(&mut self, all: Vec<Pod>) {
        let (mirrors, pods): (Vec<Pod>, Vec<Pod>) = all.into_iter().partition(Pod::is_mirror);
        self.pods = pods;
        self.mirrors_by_full_name = mirrors.into_iter().map(|p| (p.full_name(), p)).collect();
    }

    fn all(&self) -> Vec<Pod> {
        self.pods
            .iter()
            .chain(self.mirrors_by_full_name.values())
            .cloned()
            .collect()
    }
}

impl BasicPodManager {
    /// Create an empty pod manager.
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            state: RwLock::new(PodState::default()),
            control_plane,
        }
    }

    /// Apply an update and classify every regular pod in `sync_types`.
    ///
    /// Pods are stamped with the update's source unless they already carry
    /// one. `Set` replaces the pods of that source and marks UIDs not seen
    /// before as `Create`; `Update` marks the listed pods as `Update`. Every
    /// other pod is marked `Sync`.
    pub fn update_pods(&self, update: PodUpdate, sync_types: &mut SyncTypes) {
        let PodUpdate {
            mut pods,
            op,
            source,
        } = update;
        for pod in &mut pods {
            pod.annotations
                .entry(CONFIG_SOURCE_ANNOTATION.to_string())
                .or_insert_with(|| source.clone());
        }

        let mut state = self.state.write();
        match op {
            UpdateOp::Set => {
                let existing: HashSet<PodUid> = state.pods.iter().map(|p| p.uid.clone()).collect();
                for pod in pods.iter().filter(|p| !p.is_mirror()) {
                    if !existing.contains(&pod.uid) {
                        sync_types.insert(pod.uid.clone(), SyncPodType::Create);
                    }
                }
                // A set replaces only the pods of its own source.
                let mut all: Vec<Pod> = state
                    .all()
                    .into_iter()
                    .filter(|p| p.source() != Some(source.as_str()))
                    .collect();
                all.extend(pods);
                state.set(all);
            }
            UpdateOp::Update => {
                let mut all = state.all();
                for pod in pods {
                    if !pod.is_mirror() {
                        sync_types.insert(pod.uid.clone(), SyncPodType::Update);
                    }
                    match all.iter_mut().find(|p| p.uid == pod.uid) {
                        Some(slot) => *slot = pod,
                        None => all.push(pod),
                    }
                }
                state.set(all);
            }
            UpdateOp::Remove => {
                let mut all = state.all();
                all.retain(|p| !pods.iter().any(|r| r.uid == p.uid));
                state.set(all);
            }
        }

        for pod in &state.pods {
            sync_types.entry(pod.uid.clone()).or_insert(SyncPodType::Sync);
        }
    }

    /// Return the regular pods.
    #[must_use]
    pub fn pods(&self) -> Vec<Pod> {
        self.state.read().pods.clone()
    }

    /// Return the regular pods and the mirror pods keyed by full name.
    #[must_use]
    pub fn pods_and_mirror_map(&self) -> (Vec<Pod>, HashMap<String, Pod>) {
        let state = self.state.read();
        (state.pods.clone(), state.mirrors_by_full_name.clone())
    }

    /// Look up a regular pod by full name.
    #[must_use]
    pub fn pod_by_full_name(&self, full_name: &str) -> Option<Pod> {
        let (name, namespace) = parse_full_name(full_name)?;
        self.pod_by_name(namespace, name)
    }

    /// Look up a regular pod by namespace and name.
    #[must_use]
    pub fn pod_by_name(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .read()
            .pods
            .iter()
            .find(|p| p.namespace == namespace && p.name == name)
            .cloned()
    }

    /// Map a mirror pod UID to the UID of its static pod.
    ///
    /// Any other UID is returned unchanged.
    #[must_use]
    pub fn translate_pod_uid(&self, uid: &PodUid) -> PodUid {
        let state = self.state.read();
        let Some(mirror) = state.mirrors_by_full_name.values().find(|m| &m.uid == uid) else {
            return uid.clone();
        };
        state
            .pods
            .iter()
            .find(|p| p.full_name() == mirror.full_name())
            .map_or_else(|| uid.clone(), |p| p.uid.clone())
    }

    /// Return true if `mirror` mirrors the current version of `pod`.
    #[must_use]
    pub fn is_mirror_pod_of(&self, mirror: &Pod, pod: &Pod) -> bool {
        mirror
            .mirror_hash()
            .is_some_and(|hash| hash == pod.config_hash())
    }

    /// Create the mirror pod for a static pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the pod.
    pub async fn create_mirror_pod(&self, pod: &Pod) -> Result<()> {
        let mut mirror = pod.clone();
        let hash = pod.config_hash();
        mirror.annotations.remove(CONFIG_SOURCE_ANNOTATION);
        mirror.annotations.remove(CONFIG_HASH_ANNOTATION);
        mirror
            .annotations
            .insert(CONFIG_MIRROR_ANNOTATION.to_string(), hash);
        self.control_plane.create_mirror_pod(&mirror).await
    }

    /// Delete the mirror pod with a full name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is malformed or the control plane fails.
    pub async fn delete_mirror_pod(&self, full_name: &str) -> Result<()> {
        let (name, namespace) = parse_full_name(full_name)
            .ok_or_else(|| AgentError::InvalidRequest(format!("bad pod full name {full_name}")))?;
        debug!(pod = full_name, "Deleting mirror pod");
        self.control_plane.delete_mirror_pod(namespace, name).await
    }

    /// Delete every mirror pod whose static pod is gone.
    ///
    /// # Errors
    ///
    /// Returns the aggregated deletion failures.
    pub async fn delete_orphaned_mirror_pods(&self) -> Result<()> {
        let orphans: Vec<String> = {
            let state = self.state.read();
            state
                .mirrors_by_full_name
                .keys()
                .filter(|name| !state.pods.iter().any(|p| &p.full_name() == *name))
                .cloned()
                .collect()
        };

        let mut errors = AggregateError::new();
        for full_name in orphans {
            if let Err(e) = self.delete_mirror_pod(&full_name).await {
                warn!(pod = %full_name, error = %e, "Failed deleting orphaned mirror pod");
                errors.push(e);
            }
        }
        errors.into_result()
    }
}
