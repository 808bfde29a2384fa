use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::connection::ChannelState;
use crate::heartbeat::{now_ms, HeartbeatSnapshot};
use crate::lifecycle::LifecyclePhase;
use crate::services::AgentServices;
use crate::task::{Stage, TaskSummary};
use crate::worker::PoolOccupancy;

/// Read-only handles behind the local status endpoint.
#[derive(Clone)]
pub struct DashboardState {
    pub services: AgentServices,
    pub phase: watch::Receiver<LifecyclePhase>,
    pub channel: watch::Receiver<ChannelState>,
    pub heartbeat_timeout: Duration,
    pub sentinel: PathBuf,
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    phase: LifecyclePhase,
}

#[derive(Serialize)]
struct StatusResponse {
    agent_id: String,
    account_id: String,
    connection_id: String,
    hostname: String,
    version: String,
    polling_mode: bool,
    phase: LifecyclePhase,
    channel: ChannelState,
    flags: HeartbeatSnapshot,
    validating: usize,
    executing: usize,
    pools: Vec<PoolOccupancy>,
}

#[derive(Serialize)]
struct TaskEntry {
    stage: Stage,
    #[serde(flatten)]
    summary: TaskSummary,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/tasks", get(tasks_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let phase = *state.phase.borrow();
    let restart = state.services.heartbeat.restart_required(
        now_ms(),
        state.heartbeat_timeout,
        state.sentinel.exists(),
    );
    Json(HealthResponse {
        healthy: !restart
            && !matches!(phase, LifecyclePhase::Stopped | LifecyclePhase::SelfDestructed),
        phase,
    })
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let services = &state.services;
    let ctx = &services.ctx;
    Json(StatusResponse {
        agent_id: ctx.agent_id.clone(),
        account_id: ctx.account_id.clone(),
        connection_id: ctx.connection_id.clone(),
        hostname: ctx.hostname.clone(),
        version: ctx.version.clone(),
        polling_mode: ctx.polling_mode,
        phase: *state.phase.borrow(),
        channel: *state.channel.borrow(),
        flags: services.heartbeat.snapshot(
            now_ms(),
            state.heartbeat_timeout,
            state.sentinel.exists(),
        ),
        validating: services.tracker.validating_count(),
        executing: services.tracker.executing_count(),
        pools: services.pools.occupancy(),
    })
}

async fn tasks_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let tasks: Vec<TaskEntry> = state
        .services
        .tracker
        .snapshot()
        .into_iter()
        .map(|(stage, summary)| TaskEntry { stage, summary })
        .collect();
    Json(tasks)
}
