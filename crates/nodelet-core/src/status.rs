//! Pod status types.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ContainerId;

/// Observed or synthesized status of a pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodStatus {
    /// Coarse lifecycle phase.
    #[serde(default)]
    pub phase: PodPhase,
    /// Human-readable detail, set when the phase needs explaining.
    #[serde(default)]
    pub message: Option<String>,
    /// Pod-level conditions.
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    /// Per-container state.
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
    /// IP of the node running the pod.
    #[serde(default)]
    pub host_ip: Option<IpAddr>,
    /// When the agent first acknowledged the pod.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

impl PodStatus {
    /// Build a terminal `Failed` status with a message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: PodPhase::Failed,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Build a `Pending` status with a message.
    #[must_use]
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            phase: PodPhase::Pending,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Look up the status of a container by name.
    #[must_use]
    pub fn container_status(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|c| c.name == name)
    }

    /// Return the Ready condition, if present.
    #[must_use]
    pub fn ready_condition(&self) -> Option<&PodCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == PodConditionType::Ready)
    }

    /// Return true if the pod is in a terminal phase.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Phase of the pod lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PodPhase {
    /// Accepted but not all containers are running.
    Pending,
    /// Bound to the node with at least one container running or restarting.
    Running,
    /// All containers terminated successfully and will not restart.
    Succeeded,
    /// All containers terminated and at least one failed.
    Failed,
    /// State cannot be determined.
    #[default]
    Unknown,
}

impl PodPhase {
    /// Check if the phase is terminal. Terminal phases never revert.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Return the canonical name of the phase.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

/// Status of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container name from the spec.
    pub name: String,
    /// Runtime-assigned ID, if the container was created.
    #[serde(default)]
    pub container_id: Option<ContainerId>,
    /// Current state.
    pub state: ContainerState,
    /// State of the previous instance, if it terminated.
    #[serde(default)]
    pub last_termination: Option<Termination>,
    /// Whether the container passed its readiness check.
    #[serde(default)]
    pub ready: bool,
    /// Number of restarts observed.
    #[serde(default)]
    pub restart_count: u32,
    /// Image the container runs.
    #[serde(default)]
    pub image: String,
}

/// State of a container. A container is in exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Not yet running.
    Waiting {
        /// Why the container is waiting.
        #[serde(default)]
        reason: Option<String>,
    },
    /// Running.
    Running {
        /// When it started.
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    /// Exited.
    Terminated(Termination),
}

/// Details of a terminated container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Termination {
    /// Process exit code.
    pub exit_code: i32,
    /// Short reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// ID of the container instance that exited.
    #[serde(default)]
    pub container_id: Option<ContainerId>,
    /// When it exited.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerState {
    /// Shorthand for a waiting state without a reason.
    #[must_use]
    pub const fn waiting() -> Self {
        Self::Waiting { reason: None }
    }

    /// Shorthand for a running state without a start time.
    #[must_use]
    pub const fn running() -> Self {
        Self::Running { started_at: None }
    }

    /// Shorthand for a terminated state with an exit code.
    #[must_use]
    pub fn terminated(exit_code: i32) -> Self {
        Self::Terminated(Termination {
            exit_code,
            ..Default::default()
        })
    }

    /// Return true for the running state.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Return true for the waiting state.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }
}

/// A pod condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    /// What the condition describes.
    pub condition_type: PodConditionType,
    /// Whether it holds.
    pub status: ConditionStatus,
}

/// Kinds of pod condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodConditionType {
    /// Every container is ready.
    Ready,
}

/// Truth value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    /// Holds.
    True,
    /// Does not hold.
    False,
    /// Cannot be determined.
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Convert a boolean into a condition status.
    #[must_use]
    pub const fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }

    /// Return the canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}
