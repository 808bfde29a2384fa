
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

use fleet_agent::connection::ChannelState;
use fleet_agent::dashboard::{router, DashboardState};
use fleet_agent::lifecycle::LifecyclePhase;
use fleet_agent::task::TaskSummary;
use fleet_agent::worker::{PoolKind, RunnerRegistry};
use test_harness::{FakeControlPlane, AGENT_ID};

/// Helper to create test state plus the senders driving its watch channels
fn create_test_state() -> (
    DashboardState,
    watch::Sender<LifecyclePhase>,
    watch::Sender<ChannelState>,
) {
    let services = test_harness::test_services(FakeControlPlane::new(), RunnerRegistry::new());
    let (phase_tx, phase) = watch::channel(LifecyclePhase::Running);
    let (channel_tx, channel) = watch::channel(ChannelState::Open);

    let state = DashboardState {
        services,
        phase,
        channel,
        heartbeat_timeout: Duration::from_secs(15 * 60),
        sentinel: PathBuf::from("/nonexistent/start.sh"),
    };

    (state, phase_tx, channel_tx)
}

fn summary(task_id: &str, pool: PoolKind) -> TaskSummary {
    TaskSummary {
        task_id: task_id.to_string(),
        task_type: "SHELL_SCRIPT".to_string(),
        pool,
        tracked_since: chrono::Utc::now(),
    }
}

async fn get_json(app: Router, uri: &str) -> Value {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, _phase, _channel) = create_test_state();

    let json = get_json(router(state), "/health").await;

    assert_eq!(json["healthy"], true);
    assert_eq!(json["phase"], "running");
}

#[tokio::test]
async fn test_health_reports_stopped_agent_unhealthy() {
    let (state, phase, _channel) = create_test_state();
    phase.send_replace(LifecyclePhase::SelfDestructed);

    let json = get_json(router(state), "/health").await;

    assert_eq!(json["healthy"], false);
    assert_eq!(json["phase"], "self-destructed");
}

#[tokio::test]
async fn test_status_endpoint() {
    let (state, _phase, channel) = create_test_state();
    channel.send_replace(ChannelState::Reconnecting);
    state.services.heartbeat.stop_acquiring(1_000);

    let json = get_json(router(state), "/api/status").await;

    assert_eq!(json["agent_id"], AGENT_ID);
    assert_eq!(json["account_id"], test_harness::ACCOUNT_ID);
    assert_eq!(json["phase"], "running");
    assert_eq!(json["channel"], "reconnecting");
    assert_eq!(json["flags"]["accepting_tasks"], false);
    assert_eq!(json["flags"]["shutdown_pending"], true);
    assert_eq!(json["flags"]["restart_needed"], false);
    assert_eq!(json["validating"], 0);
    assert_eq!(json["executing"], 0);
    assert_eq!(json["pools"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_list_tasks_empty() {
    let (state, _phase, _channel) = create_test_state();

    let json = get_json(router(state), "/api/tasks").await;

    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_list_tasks_shows_stage_and_details() {
    let (state, _phase, _channel) = create_test_state();
    let tracker = state.services.tracker.clone();
    let _validating = tracker.begin_validation(summary("t2", PoolKind::Sync)).unwrap();
    let _executing = tracker.begin_execution(summary("t1", PoolKind::Build)).unwrap();

    let json = get_json(router(state), "/api/tasks").await;

    let tasks = json.as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["task_id"], "t1");
    assert_eq!(tasks[0]["stage"], "executing");
    assert_eq!(tasks[0]["pool"], "build");
    assert_eq!(tasks[1]["task_id"], "t2");
    assert_eq!(tasks[1]["stage"], "validating");
    assert_eq!(tasks[1]["task_type"], "SHELL_SCRIPT");
}
