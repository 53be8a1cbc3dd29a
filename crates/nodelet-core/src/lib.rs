//! Core types and utilities for nodelet.
//!
//! This crate provides the foundational types shared by the runtime boundary
//! and the node agent:
//!
//! - **Identifiers**: [`PodUid`] and [`ContainerId`]
//! - **Pods**: the desired workload ([`Pod`], [`PodSpec`], [`Container`])
//! - **Status**: synthesized pod status ([`PodStatus`], [`PodPhase`], [`ContainerStatus`])
//! - **Nodes**: the node record reported upstream ([`Node`], [`NodeCondition`])
//!
//! # Example
//!
//! ```
//! use nodelet_core::{PodUid, full_name};
//!
//! let uid = PodUid::new("6f1c2f1e").unwrap();
//! assert_eq!(full_name("web", "default"), "web_default");
//! assert_eq!(uid.as_str(), "6f1c2f1e");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod node;
pub mod pod;
pub mod status;

pub use error::{CoreError, Result};
pub use ids::{ContainerId, IdError, PodUid};
pub use node::{
    MachineInfo, Node, NodeAddress, NodeAddressType, NodeCondition, NodeConditionType,
    NodeStatus, NodeSystemInfo,
};
pub use pod::{
    full_name, parse_full_name, Container, ContainerPort, Pod, PodSpec, Protocol, ResourceList,
    RestartPolicy, Secret, Volume, VolumeSource, API_SOURCE, CONFIG_HASH_ANNOTATION,
    CONFIG_MIRROR_ANNOTATION, CONFIG_SOURCE_ANNOTATION, FILE_SOURCE,
};
pub use status::{
    ConditionStatus, ContainerState, ContainerStatus, PodCondition, PodConditionType, PodPhase,
    PodStatus, Termination,
};
