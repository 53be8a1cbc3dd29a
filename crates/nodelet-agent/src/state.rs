//! Shared agent state.
//!
//! Every long-lived service of the agent is created once here and shared by
//! the sync loop, the pod workers, the node status reporter and the HTTP
//! handlers.

use std::sync::Arc;

use nodelet_runtime::ContainerRuntime;

use crate::config::AgentConfig;
use crate::control_plane::ControlPlane;
use crate::dirs::PodDirs;
use crate::disk::DiskSpaceManager;
use crate::events::EventRecorder;
use crate::machine::MachineInfoProvider;
use crate::node_cache::NodeCache;
use crate::node_status::NodeHealthState;
use crate::pod_manager::BasicPodManager;
use crate::readiness::ReadinessManager;
use crate::status::StatusGenerator;
use crate::status_manager::StatusManager;
use crate::volumes::{VolumeManager, VolumeMounter};

/// Services shared across the agent.
#[derive(Clone)]
pub struct AgentState {
    /// Agent configuration.
    pub config: Arc<AgentConfig>,
    /// The active container runtime, possibly cached.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// The cluster control plane.
    pub control_plane: Arc<dyn ControlPlane>,
    /// Where events go.
    pub recorder: Arc<dyn EventRecorder>,
    /// Desired pods and their mirrors.
    pub pod_manager: Arc<BasicPodManager>,
    /// Cached pod statuses.
    pub status_manager: Arc<StatusManager>,
    /// Container readiness results.
    pub readiness: Arc<ReadinessManager>,
    /// Latest node record.
    pub node_cache: Arc<NodeCache>,
    /// Machine facts.
    pub machine_info: Arc<dyn MachineInfoProvider>,
    /// Disk space policy.
    pub disk: Arc<dyn DiskSpaceManager>,
    /// On-disk pod layout.
    pub dirs: PodDirs,
    /// Volumes mounted per pod.
    pub volume_manager: Arc<VolumeManager>,
    /// Volume setup and teardown.
    pub volume_mounter: Arc<VolumeMounter>,
    /// Runtime liveness.
    pub health: Arc<NodeHealthState>,
}

impl AgentState {
    /// Build the agent's services around its external collaborators.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        control_plane: Arc<dyn ControlPlane>,
        recorder: Arc<dyn EventRecorder>,
        machine_info: Arc<dyn MachineInfoProvider>,
        disk: Arc<dyn DiskSpaceManager>,
    ) -> Self {
        let dirs = PodDirs::new(config.root_dir.clone());
        let volume_mounter = Arc::new(VolumeMounter::new(
            dirs.clone(),
            config.orphaned_volume_grace(),
        ));
        Self {
            pod_manager: Arc::new(BasicPodManager::new(control_plane.clone())),
            status_manager: Arc::new(StatusManager::new()),
            readiness: Arc::new(ReadinessManager::new()),
            node_cache: Arc::new(NodeCache::new()),
            volume_manager: Arc::new(VolumeManager::new()),
            health: Arc::new(NodeHealthState::new()),
            config: Arc::new(config),
            runtime,
            control_plane,
            recorder,
            machine_info,
            disk,
            dirs,
            volume_mounter,
        }
    }

    /// Build a status generator over these services.
    #[must_use]
    pub fn status_generator(&self) -> StatusGenerator {
        StatusGenerator::new(
            self.runtime.clone(),
            self.readiness.clone(),
            self.status_manager.clone(),
            self.node_cache.clone(),
            self.recorder.clone(),
        )
    }
}

/// Builders for agent state in tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::AgentState;
    use crate::config::AgentConfig;
    use crate::control_plane::mock::MockControlPlane;
    use crate::disk::mock::FakeFs;
    use crate::disk::{DiskSpacePolicy, ThresholdDiskManager};
    use crate::events::mock::RecordingEventRecorder;
    use crate::machine::mock::StaticMachineInfo;
    use nodelet_core::MachineInfo;
    use nodelet_runtime::MemoryRuntime;
    use std::path::Path;
    use std::sync::Arc;

    /// Agent state over in-memory doubles, with handles to each double.
    pub struct TestAgent {
        /// The assembled state.
        pub state: AgentState,
        /// The runtime behind `state.runtime`.
        pub runtime: Arc<MemoryRuntime>,
        /// The control plane behind `state.control_plane`.
        pub control_plane: Arc<MockControlPlane>,
        /// The recorder behind `state.recorder`.
        pub recorder: Arc<RecordingEventRecorder>,
        /// The filesystem behind `state.disk`.
        pub fs: Arc<FakeFs>,
    }

    impl TestAgent {
        /// Build test state rooted at `root`.
        ///
        /// # Panics
        ///
        /// Panics if the default disk policy is rejected.
        #[must_use]
        pub fn new(root: &Path) -> Self {
            Self::with_config(AgentConfig {
                hostname: "node-1".to_string(),
                root_dir: root.to_path_buf(),
                orphaned_volume_grace_secs: 0,
                ..AgentConfig::default()
            })
        }

        /// Build test state with a given configuration.
        ///
        /// # Panics
        ///
        /// Panics if the default disk policy is rejected.
        #[must_use]
        pub fn with_config(config: AgentConfig) -> Self {
            let runtime = Arc::new(MemoryRuntime::new());
            let control_plane = Arc::new(MockControlPlane::new());
            let recorder = Arc::new(RecordingEventRecorder::new());
            let fs = Arc::new(FakeFs::new());
            #[allow(clippy::expect_used)]
            let disk = Arc::new(
                ThresholdDiskManager::new(fs.clone(), DiskSpacePolicy::default())
                    .expect("default disk policy is valid"),
            );
            let machine = Arc::new(StaticMachineInfo::new(MachineInfo {
                num_cores: 4,
                memory_capacity: 8 * 1024 * 1024 * 1024,
                machine_id: "machine-1".to_string(),
                system_uuid: "uuid-1".to_string(),
                boot_id: "boot-1".to_string(),
            }));
            let state = AgentState::new(
                config,
                runtime.clone(),
                control_plane.clone(),
                recorder.clone(),
                machine,
                disk,
            );
            Self {
                state,
                runtime,
                control_plane,
                recorder,
                fs,
            }
        }
    }
}
