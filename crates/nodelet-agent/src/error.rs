//! Error types for the agent crate.

use std::fmt;

use nodelet_core::CoreError;
use nodelet_runtime::RuntimeError;
use thiserror::Error;

/// Errors that can occur while running the node agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Container runtime error.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// The control plane rejected or failed a request.
    #[error("control plane error: {0}")]
    ControlPlane(String),

    /// The object already exists in the control plane.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A pod was not found.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// A container was not found in a pod.
    #[error("container {container} not found in pod {pod}")]
    ContainerNotFound {
        /// Pod full name.
        pod: String,
        /// Container name.
        container: String,
    },

    /// A request cannot be served in the pod's current state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The pod cannot run on this node.
    #[error("pod cannot run: {0}")]
    CannotRun(String),

    /// Volume setup or teardown failed.
    #[error("volume error: {0}")]
    Volume(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core type error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Several independent failures.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl AgentError {
    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::KubeApi(_) | Self::ControlPlane(_) => true,
            Self::Runtime(e) => e.is_transient(),
            Self::Aggregate(agg) => agg.errors().iter().all(Self::is_retriable),
            _ => false,
        }
    }

    /// Check if this error is a transient runtime condition.
    #[must_use]
    pub fn is_transient_runtime(&self) -> bool {
        matches!(self, Self::Runtime(e) if e.is_transient())
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::PodNotFound(_) | Self::ContainerNotFound { .. } => 404,
            Self::InvalidRequest(_) | Self::Config(_) => 400,
            Self::AlreadyExists(_) => 409,
            Self::KubeApi(_) | Self::ControlPlane(_) | Self::Runtime(_) => 503,
            _ => 500,
        }
    }
}

/// A specialized Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// A collection of independent failures.
///
/// Used where one failure must not stop the remaining work, such as killing
/// unwanted pods or cleaning up orphans.
#[derive(Debug, Default)]
pub struct AggregateError(Vec<AgentError>);

impl AggregateError {
    /// Create an empty aggregate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a failure.
    pub fn push(&mut self, error: impl Into<AgentError>) {
        self.0.push(error.into());
    }

    /// Add the failure of a result, if any.
    pub fn collect<T>(&mut self, result: Result<T>) {
        if let Err(e) = result {
            self.0.push(e);
        }
    }

    /// Return the collected failures.
    #[must_use]
    pub fn errors(&self) -> &[AgentError] {
        &self.0
    }

    /// Return true if nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the number of failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Convert into `Ok(())` when empty, the aggregate otherwise.
    ///
    /// # Errors
    ///
    /// Returns the aggregate when at least one failure was collected.
    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.0.as_slice() {
            return write!(f, "{only}");
        }
        f.write_str("[")?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{e}")?;
        }
        f.write_str("]")
    }
}

impl std::error::Error for AggregateError {}

impl FromIterator<AgentError> for AggregateError {
    fn from_iter<I: IntoIterator<Item = AgentError>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_aggregate_is_ok() {
        assert!(AggregateError::new().into_result().is_ok());
    }

    #[test]
    fn aggregate_display() {
        let mut agg = AggregateError::new();
        agg.push(AgentError::PodNotFound("a_default".into()));
        assert_eq!(agg.to_string(), "pod not found: a_default");

        agg.collect::<()>(Err(AgentError::Volume("busy".into())));
        agg.collect(Ok(()));
        assert_eq!(agg.len(), 2);
        assert_eq!(
            agg.to_string(),
            "[pod not found: a_default, volume error: busy]"
        );
        assert!(agg.into_result().is_err());
    }

    #[test]
    fn retriable_classification() {
        assert!(AgentError::ControlPlane("timeout".into()).is_retriable());
        assert!(
            AgentError::Runtime(RuntimeError::TemporarilyUnavailable("busy".into()))
                .is_retriable()
        );
        assert!(!AgentError::Runtime(RuntimeError::Other("boom".into())).is_retriable());
        assert!(!AgentError::CannotRun("privileged".into()).is_retriable());
    }

    #[test]
    fn http_status_codes() {
        assert_eq!(AgentError::PodNotFound("x".into()).http_status_code(), 404);
        assert_eq!(AgentError::InvalidRequest("x".into()).http_status_code(), 400);
        assert_eq!(AgentError::Volume("x".into()).http_status_code(), 500);
    }
}
