//! Event recording.
//!
//! Events are fire-and-forget: recording never blocks and never fails the
//! caller.

use nodelet_core::Pod;
use tracing::{info, warn};

/// Reasons attached to recorded events.
pub mod reasons {
    /// A pod was rejected for a host port conflict.
    pub const HOST_PORT_CONFLICT: &str = "hostPortConflict";
    /// A pod was rejected because its node selector does not match.
    pub const NODE_SELECTOR_MISMATCH: &str = "nodeSelectorMismatching";
    /// A pod was rejected because the node is full.
    pub const CAPACITY_EXCEEDED: &str = "capacityExceeded";
    /// A pod was rejected because the node is out of disk.
    pub const OUT_OF_DISK: &str = "OutOfDisk";
    /// Mounting a pod's volumes failed.
    pub const FAILED_MOUNT: &str = "failedMount";
    /// Reconciling a pod failed.
    pub const FAILED_SYNC: &str = "failedSync";
    /// A pod exceeded its active deadline.
    pub const DEADLINE: &str = "deadline";
    /// The node rebooted.
    pub const REBOOTED: &str = "rebooted";
    /// The agent started.
    pub const STARTING: &str = "starting";
    /// The node became ready.
    pub const NODE_READY: &str = "NodeReady";
    /// The node became not ready.
    pub const NODE_NOT_READY: &str = "NodeNotReady";
    /// The node became schedulable.
    pub const NODE_SCHEDULABLE: &str = "NodeSchedulable";
    /// The node became unschedulable.
    pub const NODE_NOT_SCHEDULABLE: &str = "NodeNotSchedulable";
}

/// The kind of object an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A pod.
    Pod,
    /// A node.
    Node,
}

impl ObjectKind {
    /// Return the API kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::Node => "Node",
        }
    }
}

/// Reference to the object an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object kind.
    pub kind: ObjectKind,
    /// Namespace; empty for nodes.
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Object UID, if known.
    pub uid: Option<String>,
}

impl ObjectRef {
    /// Reference a pod.
    #[must_use]
    pub fn pod(pod: &Pod) -> Self {
        Self {
            kind: ObjectKind::Pod,
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            uid: Some(pod.uid.to_string()),
        }
    }

    /// Reference a node by name.
    #[must_use]
    pub fn node(name: &str) -> Self {
        Self {
            kind: ObjectKind::Node,
            namespace: String::new(),
            name: name.to_string(),
            uid: Some(name.to_string()),
        }
    }
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

impl EventType {
    /// Return the API type name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Records events about pods and nodes.
pub trait EventRecorder: Send + Sync {
    /// Record an event.
    fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str);
}

/// An event recorder that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                kind = object.kind.as_str(),
                namespace = %object.namespace,
                name = %object.name,
                reason,
                message,
                "Event"
            ),
            EventType::Warning => warn!(
                kind = object.kind.as_str(),
                namespace = %object.namespace,
                name = %object.name,
                reason,
                message,
                "Event"
            ),
        }
    }
}

/// A recorder that keeps events in memory for assertions.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// One recorded event.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedEvent {
        /// The object.
        pub object: ObjectRef,
        /// Its severity.
        pub event_type: EventType,
        /// Its reason.
        pub reason: String,
        /// Its message.
        pub message: String,
    }

    /// Event recorder that stores every event.
    #[derive(Debug, Default)]
    pub struct RecordingEventRecorder {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEventRecorder {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Return every recorded event.
        #[must_use]
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().clone()
        }

        /// Return the reasons of every recorded event, in order.
        #[must_use]
        pub fn reasons(&self) -> Vec<String> {
            self.events.lock().iter().map(|e| e.reason.clone()).collect()
        }

        /// Count the events with a reason.
        #[must_use]
        pub fn count(&self, reason: &str) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.reason == reason)
                .count()
        }

        /// Forget every recorded event.
        pub fn clear(&self) {
            self.events.lock().clear();
        }
    }

    impl EventRecorder for RecordingEventRecorder {
        fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
            self.events.lock().push(RecordedEvent {
                object: object.clone(),
                event_type,
                reason: reason.to_string(),
                message: message.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingEventRecorder;
    use super::*;

    #[test]
    fn recording_recorder_counts_reasons() {
        let recorder = RecordingEventRecorder::new();
        let node = ObjectRef::node("node-1");

        recorder.event(&node, EventType::Normal, reasons::NODE_READY, "ready");
        recorder.event(&node, EventType::Normal, reasons::NODE_READY, "ready");
        recorder.event(&node, EventType::Warning, reasons::REBOOTED, "rebooted");

        assert_eq!(recorder.count(reasons::NODE_READY), 2);
        assert_eq!(recorder.reasons().last().map(String::as_str), Some("rebooted"));

        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}
