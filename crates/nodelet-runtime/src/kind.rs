//! Runtime selection.
//!
//! Exactly one runtime is active per agent. The kind is parsed from
//! configuration and resolved into a driver once, at construction.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::memory::MemoryRuntime;
use crate::ContainerRuntime;

/// The closed set of runtime kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker engine.
    Docker,
    /// rkt.
    Rkt,
    /// In-process runtime that tracks pods without starting processes.
    #[default]
    Memory,
}

impl RuntimeKind {
    /// Return the configuration name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Rkt => "rkt",
            Self::Memory => "memory",
        }
    }

    /// Resolve this kind into a runtime driver.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unsupported`] for kinds without a driver in
    /// this build.
    pub fn connect(self) -> Result<Arc<dyn ContainerRuntime>> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryRuntime::new())),
            Self::Docker | Self::Rkt => Err(RuntimeError::Unsupported(self)),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "rkt" => Ok(Self::Rkt),
            "memory" | "fake" => Ok(Self::Memory),
            other => Err(RuntimeError::UnknownKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kinds() {
        assert_eq!("docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!(" RKT ".parse::<RuntimeKind>().unwrap(), RuntimeKind::Rkt);
        assert_eq!("memory".parse::<RuntimeKind>().unwrap(), RuntimeKind::Memory);
        assert!(matches!(
            "lxc".parse::<RuntimeKind>(),
            Err(RuntimeError::UnknownKind(_))
        ));
    }

    #[tokio::test]
    async fn connect_resolves_memory_runtime() {
        let runtime = RuntimeKind::Memory.connect().unwrap();
        let version = runtime.version().await.unwrap();
        assert_eq!(version.kind, RuntimeKind::Memory);
    }

    #[test]
    fn connect_rejects_driverless_kinds() {
        assert!(matches!(
            RuntimeKind::Docker.connect(),
            Err(RuntimeError::Unsupported(RuntimeKind::Docker))
        ));
    }
}
