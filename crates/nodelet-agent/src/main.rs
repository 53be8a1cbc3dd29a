//! Nodelet - node agent binary
//!
//! Reconciles the pods assigned to this node against the container runtime
//! and reports node and pod status to the cluster.
//!
//! # HTTP Endpoints
//!
//! - `GET /healthz` - Runtime liveness
//! - `GET /pods` - Desired pods on this node
//! - `GET /containerLogs/:namespace/:pod/:container` - Container logs

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use nodelet_agent::disk::{DiskSpacePolicy, ThresholdDiskManager, UnmeasuredFs};
use nodelet_agent::machine::{CachedMachineInfo, HostMachineInfo};
use nodelet_agent::gc::run_garbage_collection;
use nodelet_agent::node_status::{record_agent_start, run_runtime_probe};
use nodelet_agent::{
    AgentConfig, AgentError, AgentState, ApiSource, ControlPlane, EventRecorder, FileSource,
    KubeControlPlane, KubeEventRecorder, LogRecorder, MainLoop, NodeAgent, NodeStatusReporter,
    SourcesReady, StandaloneControlPlane,
};
use nodelet_core::{full_name, API_SOURCE, FILE_SOURCE};
use nodelet_runtime::{CachedRuntime, GcTarget, LogOptions};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long a runtime pod listing may be served from cache.
const RUNTIME_CACHE_TTL: Duration = Duration::from_secs(2);

/// Capacity of the pod update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 50;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    agent: Arc<NodeAgent>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Error response format.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

fn error_response(e: &AgentError) -> axum::response::Response {
    let code = e.http_status_code();
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse {
            error: e.to_string(),
            code,
        }),
    )
        .into_response()
}

/// GET /healthz
async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    let agent_state = state.agent.state();
    let threshold = agent_state.config.runtime_up_threshold();
    if agent_state.health.runtime_up_within(threshold) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("container runtime down or not responding within {threshold:?}"),
        )
            .into_response()
    }
}

/// GET /pods
async fn pods_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agent.pods())
}

/// GET /containerLogs/:namespace/:pod/:container
async fn container_logs_handler(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(opts): Query<LogOptions>,
) -> impl IntoResponse {
    let pod_full_name = full_name(&pod, &namespace);
    match state
        .agent
        .container_logs(&pod_full_name, &container, &opts)
        .await
    {
        Ok(logs) => logs.into_response(),
        Err(e) => {
            tracing::warn!(
                pod = %pod_full_name,
                container,
                error = %e,
                "Failed to get container logs"
            );
            error_response(&e)
        }
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/pods", get(pods_handler))
        .route(
            "/containerLogs/:namespace/:pod/:container",
            get(container_logs_handler),
        )
        .with_state(state)
}

// ============================================================================
// Startup
// ============================================================================

/// Connect to the cluster, or fall back to standalone mode.
async fn connect_cluster(
    config: &mut AgentConfig,
) -> (
    Option<kube::Client>,
    Arc<dyn ControlPlane>,
    Arc<dyn EventRecorder>,
) {
    match kube::Client::try_default().await {
        Ok(client) => {
            tracing::info!("Connected to Kubernetes cluster");
            let control_plane = KubeControlPlane::new(client.clone(), &config.hostname);
            let recorder = KubeEventRecorder::new(
                client.clone(),
                &config.hostname,
                &config.event_namespace,
            );
            (Some(client), Arc::new(control_plane), Arc::new(recorder))
        }
        Err(e) => {
            tracing::warn!(error = %e, "No cluster reachable, running standalone");
            config.register_node = false;
            config.config_sources = vec![FILE_SOURCE.to_string()];
            (None, Arc::new(StandaloneControlPlane), Arc::new(LogRecorder))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nodelet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting nodelet");

    let mut config = AgentConfig::from_env();
    tracing::info!(
        hostname = %config.hostname,
        root_dir = %config.root_dir.display(),
        runtime = %config.runtime,
        "Loaded agent configuration"
    );

    let runtime = Arc::new(CachedRuntime::new(config.runtime.connect()?, RUNTIME_CACHE_TTL));
    let (client, control_plane, recorder) = connect_cluster(&mut config).await;

    let disk = ThresholdDiskManager::new(Arc::new(UnmeasuredFs), DiskSpacePolicy::default())?;
    let machine_info = CachedMachineInfo::new(Arc::new(HostMachineInfo::default()));
    let listen_addr = config.listen_addr.clone();
    let sources = Arc::new(SourcesReady::new(config.config_sources.iter()));
    let standalone = client.is_none();

    let state = AgentState::new(
        config,
        runtime,
        control_plane.clone(),
        recorder,
        Arc::new(machine_info),
        Arc::new(disk),
    );
    state.dirs.make_root_dirs().await?;
    record_agent_start(&*state.recorder, &state.config.hostname);

    state.status_manager.start(control_plane);
    tokio::spawn(run_runtime_probe(
        state.runtime.clone(),
        state.health.clone(),
        state.config.runtime_probe_interval(),
    ));
    for target in [GcTarget::Containers, GcTarget::Images] {
        tokio::spawn(run_garbage_collection(
            state.runtime.clone(),
            target,
            state.config.gc_period(target),
        ));
    }
    if !standalone {
        let reporter = Arc::new(NodeStatusReporter::new(state.clone()));
        tokio::spawn(reporter.run());
        tracing::info!("Started node status reporter");
    }

    // Config sources
    let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let resync = state.config.resync_interval();
    tokio::spawn(FileSource::new(state.dirs.manifests_dir()).run(tx.clone(), resync));
    if let Some(client) = client {
        if state.config.config_sources.iter().any(|s| s == API_SOURCE) {
            tokio::spawn(ApiSource::new(client, &state.config.hostname).run(tx.clone()));
        }
    }
    drop(tx);

    let agent = Arc::new(NodeAgent::new(state, sources));
    tokio::spawn(MainLoop::new(agent.clone()).run(rx));
    tracing::info!("Started sync loop");

    let app = create_router(AppState { agent });

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
