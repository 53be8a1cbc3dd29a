//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use nodelet_runtime::{GcTarget, RuntimeKind};
use serde::Deserialize;

/// Configuration for the node agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name this node registers under.
    #[serde(default = "AgentConfig::default_hostname")]
    pub hostname: String,

    /// Root of the agent's on-disk state.
    #[serde(default = "AgentConfig::default_root_dir")]
    pub root_dir: PathBuf,

    /// Which container runtime to drive.
    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Interval between full sync passes when no update arrives.
    #[serde(default = "AgentConfig::default_resync_interval")]
    pub resync_interval_secs: u64,

    /// How long the main loop keeps collecting updates after the first one.
    #[serde(default = "AgentConfig::default_drain_window")]
    pub drain_window_ms: u64,

    /// Interval between node status reports.
    #[serde(default = "AgentConfig::default_node_status_update")]
    pub node_status_update_secs: u64,

    /// How long after the last successful probe the runtime counts as up.
    #[serde(default = "AgentConfig::default_runtime_up_threshold")]
    pub runtime_up_threshold_secs: u64,

    /// Interval between runtime liveness probes.
    #[serde(default = "AgentConfig::default_runtime_probe_interval")]
    pub runtime_probe_interval_secs: u64,

    /// Register the node with the control plane before reporting status.
    #[serde(default = "AgentConfig::default_true")]
    pub register_node: bool,

    /// Require a pod CIDR before reporting the network as configured.
    #[serde(default)]
    pub configure_network: bool,

    /// Pod capacity reported for the node.
    #[serde(default = "AgentConfig::default_max_pods")]
    pub max_pods: u64,

    /// Allow privileged containers.
    #[serde(default)]
    pub allow_privileged: bool,

    /// Config sources allowed to run pods on the host network.
    #[serde(default = "AgentConfig::default_host_network_sources")]
    pub host_network_sources: Vec<String>,

    /// Config sources that must report before cleanup runs.
    #[serde(default = "AgentConfig::default_config_sources")]
    pub config_sources: Vec<String>,

    /// How long a volume must stay orphaned before it is torn down.
    #[serde(default = "AgentConfig::default_orphaned_volume_grace")]
    pub orphaned_volume_grace_secs: u64,

    /// Interval between container garbage collection passes.
    #[serde(default = "AgentConfig::default_container_gc_period")]
    pub container_gc_period_secs: u64,

    /// Interval between image garbage collection passes.
    #[serde(default = "AgentConfig::default_image_gc_period")]
    pub image_gc_period_secs: u64,

    /// Listen address for the HTTP endpoints.
    #[serde(default = "AgentConfig::default_listen_addr")]
    pub listen_addr: String,

    /// Namespace node events are recorded in.
    #[serde(default = "AgentConfig::default_event_namespace")]
    pub event_namespace: String,
}

impl AgentConfig {
    fn default_hostname() -> String {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .map_or_else(|| "localhost".to_string(), |h| h.trim().to_lowercase())
    }

    fn default_root_dir() -> PathBuf {
        PathBuf::from("/var/lib/nodelet")
    }

    const fn default_resync_interval() -> u64 {
        10
    }

    const fn default_drain_window() -> u64 {
        5
    }

    const fn default_node_status_update() -> u64 {
        10
    }

    const fn default_runtime_up_threshold() -> u64 {
        30
    }

    const fn default_runtime_probe_interval() -> u64 {
        5
    }

    const fn default_true() -> bool {
        true
    }

    const fn default_max_pods() -> u64 {
        40
    }

    fn default_host_network_sources() -> Vec<String> {
        vec![nodelet_core::FILE_SOURCE.to_string()]
    }

    fn default_config_sources() -> Vec<String> {
        vec![
            nodelet_core::API_SOURCE.to_string(),
            nodelet_core::FILE_SOURCE.to_string(),
        ]
    }

    const fn default_orphaned_volume_grace() -> u64 {
        60
    }

    const fn default_container_gc_period() -> u64 {
        60
    }

    const fn default_image_gc_period() -> u64 {
        300
    }

    fn default_listen_addr() -> String {
        "0.0.0.0:10255".to_string()
    }

    fn default_event_namespace() -> String {
        "default".to_string()
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `NODELET_HOSTNAME`: node name
    /// - `NODELET_ROOT_DIR`: root of on-disk state
    /// - `NODELET_RUNTIME`: `docker`, `rkt` or `memory`
    /// - `NODELET_RESYNC_INTERVAL_SECS`: full sync interval
    /// - `NODELET_DRAIN_WINDOW_MS`: update batching window
    /// - `NODELET_NODE_STATUS_UPDATE_SECS`: node status interval
    /// - `NODELET_RUNTIME_UP_THRESHOLD_SECS`: runtime staleness threshold
    /// - `NODELET_REGISTER_NODE`: register the node record
    /// - `NODELET_CONFIGURE_NETWORK`: require a pod CIDR
    /// - `NODELET_MAX_PODS`: pod capacity
    /// - `NODELET_ALLOW_PRIVILEGED`: allow privileged containers
    /// - `NODELET_HOST_NETWORK_SOURCES`: comma list of sources
    /// - `NODELET_CONFIG_SOURCES`: comma list of sources
    /// - `NODELET_ORPHANED_VOLUME_GRACE_SECS`: orphaned volume grace period
    /// - `NODELET_CONTAINER_GC_PERIOD_SECS`: container GC interval
    /// - `NODELET_IMAGE_GC_PERIOD_SECS`: image GC interval
    /// - `LISTEN_ADDR`: HTTP listen address
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("NODELET_HOSTNAME") {
            if !val.trim().is_empty() {
                config.hostname = val.trim().to_lowercase();
            }
        }
        if let Ok(val) = std::env::var("NODELET_ROOT_DIR") {
            config.root_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("NODELET_RUNTIME") {
            if let Ok(kind) = val.parse() {
                config.runtime = kind;
            }
        }
        parse_env("NODELET_RESYNC_INTERVAL_SECS", &mut config.resync_interval_secs);
        parse_env("NODELET_DRAIN_WINDOW_MS", &mut config.drain_window_ms);
        parse_env(
            "NODELET_NODE_STATUS_UPDATE_SECS",
            &mut config.node_status_update_secs,
        );
        parse_env(
            "NODELET_RUNTIME_UP_THRESHOLD_SECS",
            &mut config.runtime_up_threshold_secs,
        );
        parse_env("NODELET_REGISTER_NODE", &mut config.register_node);
        parse_env("NODELET_CONFIGURE_NETWORK", &mut config.configure_network);
        parse_env("NODELET_MAX_PODS", &mut config.max_pods);
        parse_env("NODELET_ALLOW_PRIVILEGED", &mut config.allow_privileged);
        if let Ok(val) = std::env::var("NODELET_HOST_NETWORK_SOURCES") {
            config.host_network_sources = split_list(&val);
        }
        if let Ok(val) = std::env::var("NODELET_CONFIG_SOURCES") {
            config.config_sources = split_list(&val);
        }
        parse_env(
            "NODELET_ORPHANED_VOLUME_GRACE_SECS",
            &mut config.orphaned_volume_grace_secs,
        );
        parse_env(
            "NODELET_CONTAINER_GC_PERIOD_SECS",
            &mut config.container_gc_period_secs,
        );
        parse_env("NODELET_IMAGE_GC_PERIOD_SECS", &mut config.image_gc_period_secs);
        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }

        config
    }

    /// Get the resync interval as a `Duration`.
    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Get the drain window as a `Duration`.
    #[must_use]
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    /// Get the node status interval as a `Duration`.
    #[must_use]
    pub fn node_status_update_frequency(&self) -> Duration {
        Duration::from_secs(self.node_status_update_secs)
    }

    /// Get the runtime staleness threshold as a `Duration`.
    #[must_use]
    pub fn runtime_up_threshold(&self) -> Duration {
        Duration::from_secs(self.runtime_up_threshold_secs)
    }

    /// Get the runtime probe interval as a `Duration`.
    #[must_use]
    pub fn runtime_probe_interval(&self) -> Duration {
        Duration::from_secs(self.runtime_probe_interval_secs)
    }

    /// Get the orphaned volume grace period as a `Duration`.
    #[must_use]
    pub fn orphaned_volume_grace(&self) -> Duration {
        Duration::from_secs(self.orphaned_volume_grace_secs)
    }

    /// Get the garbage collection interval for `target`.
    #[must_use]
    pub fn gc_period(&self, target: GcTarget) -> Duration {
        match target {
            GcTarget::Containers => Duration::from_secs(self.container_gc_period_secs),
            GcTarget::Images => Duration::from_secs(self.image_gc_period_secs),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: Self::default_hostname(),
            root_dir: Self::default_root_dir(),
            runtime: RuntimeKind::default(),
            resync_interval_secs: Self::default_resync_interval(),
            drain_window_ms: Self::default_drain_window(),
            node_status_update_secs: Self::default_node_status_update(),
            runtime_up_threshold_secs: Self::default_runtime_up_threshold(),
            runtime_probe_interval_secs: Self::default_runtime_probe_interval(),
            register_node: true,
            configure_network: false,
            max_pods: Self::default_max_pods(),
            allow_privileged: false,
            host_network_sources: Self::default_host_network_sources(),
            config_sources: Self::default_config_sources(),
            orphaned_volume_grace_secs: Self::default_orphaned_volume_grace(),
            container_gc_period_secs: Self::default_container_gc_period(),
            image_gc_period_secs: Self::default_image_gc_period(),
            listen_addr: Self::default_listen_addr(),
            event_namespace: Self::default_event_namespace(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(parsed) = val.trim().parse() {
            *target = parsed;
        }
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.root_dir, PathBuf::from("/var/lib/nodelet"));
        assert_eq!(config.runtime, RuntimeKind::Memory);
        assert_eq!(config.resync_interval(), Duration::from_secs(10));
        assert_eq!(config.drain_window(), Duration::from_millis(5));
        assert_eq!(config.max_pods, 40);
        assert_eq!(config.gc_period(GcTarget::Containers), Duration::from_secs(60));
        assert_eq!(config.gc_period(GcTarget::Images), Duration::from_secs(300));
        assert_eq!(config.config_sources, vec!["api", "file"]);
        assert_eq!(config.host_network_sources, vec!["file"]);
        assert!(config.register_node);
        assert!(!config.allow_privileged);
    }

    #[test]
    fn config_deserialize_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"hostname": "node-1", "runtime": "rkt", "max_pods": 8}"#)
                .unwrap();
        assert_eq!(config.hostname, "node-1");
        assert_eq!(config.runtime, RuntimeKind::Rkt);
        assert_eq!(config.max_pods, 8);
        assert_eq!(config.orphaned_volume_grace(), Duration::from_secs(60));
    }

    #[test]
    fn split_comma_lists() {
        assert_eq!(split_list("api, file,,http "), vec!["api", "file", "http"]);
        assert!(split_list("").is_empty());
    }
}
