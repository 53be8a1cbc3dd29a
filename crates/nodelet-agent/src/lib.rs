//! Node agent for nodelet.
//!
//! The agent runs on every node. It receives the pods assigned to the node
//! from one or more config sources, admits them, and drives the container
//! runtime until what runs matches what is desired. It also reports node and
//! pod status back to the control plane.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐
//! │  ApiSource   │  │  FileSource  │        config sources
//! └──────┬───────┘  └──────┬───────┘
//!        └────────┬────────┘
//!                 ▼  PodUpdate
//! ┌─────────────────────────────────┐
//! │            MainLoop             │  drain window + resync tick
//! └────────────────┬────────────────┘
//!                  ▼
//! ┌─────────────────────────────────┐
//! │      NodeAgent::sync_pods       │
//! │  ┌───────────┐ ┌─────────────┐  │
//! │  │ Admission │ │ PodWorkers  │──┼──▶ PodReconciler ──▶ ContainerRuntime
//! │  └───────────┘ └─────────────┘  │
//! │  kill unwanted, clean orphans   │
//! └─────────────────────────────────┘
//!
//! NodeStatusReporter ──▶ ControlPlane ◀── StatusManager
//! run_garbage_collection ──▶ ContainerRuntime
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nodelet_agent::{AgentConfig, AgentState, MainLoop, NodeAgent, SourcesReady};
//! use nodelet_agent::{LogRecorder, StandaloneControlPlane};
//! use nodelet_agent::disk::{DiskSpacePolicy, ThresholdDiskManager, UnmeasuredFs};
//! use nodelet_agent::machine::{CachedMachineInfo, HostMachineInfo};
//! use nodelet_runtime::RuntimeKind;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::default();
//! let runtime = RuntimeKind::Memory.connect()?;
//! let disk = ThresholdDiskManager::new(Arc::new(UnmeasuredFs), DiskSpacePolicy::default())?;
//! let state = AgentState::new(
//!     config,
//!     runtime,
//!     Arc::new(StandaloneControlPlane),
//!     Arc::new(LogRecorder),
//!     Arc::new(CachedMachineInfo::new(Arc::new(HostMachineInfo::default()))),
//!     Arc::new(disk),
//! );
//!
//! let sources = Arc::new(SourcesReady::new(["file"]));
//! let agent = Arc::new(NodeAgent::new(state, sources));
//! let (tx, rx) = tokio::sync::mpsc::channel(16);
//! # drop(tx);
//! MainLoop::new(agent).run(rx).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for in-memory doubles of the control
//! plane, event recorder, filesystem and machine info, plus
//! [`state::mock::TestAgent`] which wires them together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod config;
pub mod control_plane;
pub mod dirs;
pub mod disk;
pub mod error;
pub mod events;
pub mod gc;
pub mod k8s;
pub mod machine;
pub mod node_cache;
pub mod node_status;
pub mod pod_manager;
pub mod readiness;
pub mod reconcile;
pub mod sources;
pub mod state;
pub mod status;
pub mod status_manager;
pub mod sync;
pub mod sync_loop;
pub mod update;
pub mod volumes;
pub mod workers;

pub use config::AgentConfig;
pub use control_plane::{ControlPlane, StandaloneControlPlane};
pub use error::{AgentError, AggregateError, Result};
pub use events::{EventRecorder, EventType, LogRecorder, ObjectRef};
pub use k8s::{ApiSource, KubeControlPlane, KubeEventRecorder};
pub use node_status::NodeStatusReporter;
pub use sources::{FileSource, SourcesReady};
pub use state::AgentState;
pub use sync::NodeAgent;
pub use sync_loop::MainLoop;
pub use update::{PodUpdate, SyncPodType, UpdateOp};

#[cfg(any(test, feature = "test-utils"))]
pub use control_plane::mock::MockControlPlane;
#[cfg(any(test, feature = "test-utils"))]
pub use events::mock::RecordingEventRecorder;
