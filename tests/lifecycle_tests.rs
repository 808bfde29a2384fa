//! Lifecycle tests: registration, watcher handshake, upgrades, drains and profiles.


use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use fleet_agent::config::{AgentConfig, ConnectionConfig};
use fleet_agent::connection::ConnectionManager;
use fleet_agent::context::AgentIdentity;
use fleet_agent::control::{Profile, RegistrationOutcome, UpgradeScripts};
use fleet_agent::error::AgentError;
use fleet_agent::lifecycle::{
    await_go_ahead, register, LifecycleCommand, LifecycleController, LifecyclePhase,
    ProfileCheck, ProfileChecker, StatusStore, WatcherMessage, NO_PROFILE, WATCHER_KEY,
};
use fleet_agent::secrets::ResolvedTask;
use fleet_agent::task::SHELL_SCRIPT;
use fleet_agent::worker::{RunnerRegistry, ShellRunner};
use test_harness::{
    assert_eventually, assigned, Behavior, FakeControlPlane, MemoryStatusStore, ScriptedRunner,
    StaticProbe, TestAgent, ACCOUNT_ID, AGENT_ID,
};

const ECHO: &str = "ECHO";

struct Lifecycle {
    agent: TestAgent,
    store: Arc<MemoryStatusStore>,
    controller: Arc<LifecycleController>,
    phase: watch::Receiver<LifecyclePhase>,
    shutdown: CancellationToken,
    scripts: TempDir,
}

fn lifecycle(behavior: Behavior, watched: bool) -> Lifecycle {
    let agent = TestAgent::new(
        RunnerRegistry::new().with(ScriptedRunner::new(ECHO, behavior)),
        StaticProbe::new(&[]),
    );
    let scripts = tempfile::tempdir().unwrap();
    std::fs::write(scripts.path().join("start.sh"), "exec agent-1.0.0\n").unwrap();

    let mut config = AgentConfig {
        account_id: ACCOUNT_ID.to_string(),
        version: "1.0.0".to_string(),
        ..Default::default()
    };
    config.lifecycle.scripts_dir = scripts.path().to_path_buf();
    config.lifecycle.supervisor_sentinel = scripts.path().join("no-supervisor");
    config.lifecycle.watched = watched;

    let (commands_tx, _commands) = mpsc::unbounded_channel();
    let connection = Arc::new(ConnectionManager::new(
        agent.services.clone(),
        agent.dispatcher.clone(),
        ConnectionConfig::default(),
        scripts.path().join("no-supervisor"),
        commands_tx,
    ));
    let profile = Arc::new(ProfileChecker::new(
        agent.services.clone(),
        ShellRunner::new(),
        scripts.path().join("profile.json"),
        Duration::from_secs(60),
    ));
    let store = MemoryStatusStore::new();
    let (phase_tx, phase) = watch::channel(LifecyclePhase::Starting);
    let shutdown = CancellationToken::new();
    let controller = Arc::new(LifecycleController::new(
        agent.services.clone(),
        connection,
        store.clone() as Arc<dyn StatusStore>,
        profile,
        phase_tx,
        &config,
        shutdown.clone(),
    ));

    Lifecycle {
        agent,
        store,
        controller,
        phase,
        shutdown,
        scripts,
    }
}

/// An assigned task whose deadline outlasts any runner sleep in these tests.
fn long_running(task_id: &str) -> ResolvedTask {
    let mut package = assigned(task_id, ECHO);
    package.task.timeout = Duration::from_secs(2 * 60 * 60);
    ResolvedTask::plain(package)
}

fn identity() -> AgentIdentity {
    let config = AgentConfig {
        account_id: ACCOUNT_ID.to_string(),
        ..Default::default()
    };
    AgentIdentity::new(&config, vec![SHELL_SCRIPT.to_string()])
}

fn upgrade_to(version: &str) -> UpgradeScripts {
    let mut scripts = BTreeMap::new();
    scripts.insert("start.sh".to_string(), format!("exec agent-{}\n", version));
    UpgradeScripts {
        version: version.to_string(),
        scripts,
    }
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_registration_retries_until_registered() {
    let control = FakeControlPlane::new();
    control.script_registration(Err(AgentError::GrpcError(tonic::Status::unavailable(
        "down",
    ))));
    let heartbeat = fleet_agent::heartbeat::HeartbeatState::default();

    let started = tokio::time::Instant::now();
    let ctx = register(
        &*control,
        &identity(),
        &heartbeat,
        Duration::from_secs(60),
        Duration::from_secs(15),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(ctx.agent_id, AGENT_ID);
    assert_eq!(control.register_calls.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_secs(60));
}

#[tokio::test]
async fn test_registration_self_destruct_abandons() {
    let control = FakeControlPlane::new();
    control.script_registration(Ok(RegistrationOutcome::SelfDestruct));
    let heartbeat = fleet_agent::heartbeat::HeartbeatState::default();

    let result = register(
        &*control,
        &identity(),
        &heartbeat,
        Duration::from_secs(60),
        Duration::from_secs(15),
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(AgentError::RegistrationAbandoned)));
    assert!(heartbeat.is_self_destructed());
    assert_eq!(control.register_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_registration_follows_migrate() {
    let control = FakeControlPlane::new();
    control.script_registration(Ok(RegistrationOutcome::Migrate {
        url: "https://manager-2.example.com".into(),
    }));
    let heartbeat = fleet_agent::heartbeat::HeartbeatState::default();

    let ctx = register(
        &*control,
        &identity(),
        &heartbeat,
        Duration::from_secs(60),
        Duration::from_secs(15),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(ctx.is_some());
    assert_eq!(
        control.migrations(),
        vec!["https://manager-2.example.com/".to_string()]
    );
    assert_eq!(
        heartbeat.migrate_target().as_deref(),
        Some("https://manager-2.example.com/")
    );
    assert_eq!(control.register_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_registration_stops_on_shutdown() {
    let control = FakeControlPlane::new();
    control.script_registration(Err(AgentError::GrpcError(tonic::Status::unavailable(
        "down",
    ))));
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let ctx = register(
        &*control,
        &identity(),
        &fleet_agent::heartbeat::HeartbeatState::default(),
        Duration::from_secs(60),
        Duration::from_secs(15),
        &shutdown,
    )
    .await
    .unwrap();

    assert!(ctx.is_none());
    assert_eq!(control.register_calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Watcher Handshake
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_go_ahead_times_out_and_keeps_pending_messages() {
    let store = MemoryStatusStore::new();
    store.send("agent-9", "resume").await.unwrap();

    let started = tokio::time::Instant::now();
    let pending = await_go_ahead(&*store, "agent-9", Duration::from_secs(5)).await;

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(pending, vec![WatcherMessage::Resume]);
    assert_eq!(store.inbox(WATCHER_KEY), vec!["started".to_string()]);

    let entry = store.entry("agent-9");
    assert!(entry.contains_key("pid"));
    assert!(!entry.contains_key("is-new"));
}

#[tokio::test(start_paused = true)]
async fn test_go_ahead_received() {
    let store = MemoryStatusStore::new();
    store.send("agent-9", "go-ahead").await.unwrap();

    let started = tokio::time::Instant::now();
    let pending = await_go_ahead(&*store, "agent-9", Duration::from_secs(300)).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(pending.is_empty());
}

// =============================================================================
// Upgrades
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_upgrade_replaces_scripts_and_respawns_after_drain() {
    let lc = lifecycle(Behavior::Sleep(Duration::from_secs(30 * 60)), true);
    lc.agent.control.set_upgrade(upgrade_to("1.1.0"));
    assert!(
        lc.agent.engine.execute(long_running("t1")).await
    );

    assert!(lc.controller.check_upgrade().await.unwrap());

    let heartbeat = &lc.agent.services.heartbeat;
    assert!(heartbeat.is_upgrade_pending());
    assert_eq!(*lc.phase.borrow(), LifecyclePhase::UpgradePending);
    assert_eq!(
        std::fs::read_to_string(lc.scripts.path().join("start.sh")).unwrap(),
        "exec agent-1.1.0\n"
    );
    assert_eq!(
        std::fs::read_to_string(lc.scripts.path().join("backup.1.0.0").join("start.sh")).unwrap(),
        "exec agent-1.0.0\n"
    );
    let entry = lc.store.entry(lc.controller.key());
    assert_eq!(entry["phase"], json!("upgrade-pending"));
    assert_eq!(entry["upgrade-pending"], json!(true));

    // A second check while pending does nothing
    assert!(!lc.controller.check_upgrade().await.unwrap());

    // Nothing is signalled while t1 still runs
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(!lc.store.inbox(WATCHER_KEY).contains(&"respawn".to_string()));
    assert!(lc.agent.services.tracker.is_executing("t1"));

    let store = lc.store.clone();
    assert_eventually(
        || store.inbox(WATCHER_KEY).contains(&"respawn".to_string()),
        Duration::from_secs(30 * 60),
        "respawn should be signalled once t1 drained",
    )
    .await;
    assert!(lc.agent.control.response_for("t1").is_some());
    assert!(!lc.shutdown.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_unwatched_upgrade_stops_after_drain() {
    let lc = lifecycle(Behavior::Succeed(String::new()), false);
    lc.agent.control.set_upgrade(upgrade_to("1.1.0"));

    assert!(lc.controller.check_upgrade().await.unwrap());

    let shutdown = lc.shutdown.clone();
    assert_eventually(
        || shutdown.is_cancelled(),
        Duration::from_secs(5),
        "agent should stop so the new scripts take effect",
    )
    .await;
    assert!(lc.store.inbox(WATCHER_KEY).is_empty());
}

#[tokio::test]
async fn test_matching_scripts_need_no_upgrade() {
    let lc = lifecycle(Behavior::Succeed(String::new()), true);
    lc.agent.control.set_upgrade(upgrade_to("1.0.0"));

    assert!(!lc.controller.check_upgrade().await.unwrap());
    assert!(!lc.agent.services.heartbeat.is_upgrade_pending());
    assert_eq!(lc.agent.control.upgrade_calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Drains and Status
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_acquiring_drains_then_stops() {
    let lc = lifecycle(Behavior::Sleep(Duration::from_secs(5 * 60)), true);
    lc.agent.engine.execute(long_running("t1")).await;

    lc.controller
        .handle_command(LifecycleCommand::StopAcquiring)
        .await;

    assert!(!lc.agent.services.heartbeat.is_accepting());
    assert_eq!(*lc.phase.borrow(), LifecyclePhase::ShutdownPending);
    assert_eq!(
        lc.store.entry(lc.controller.key())["shutdown-pending"],
        json!(true)
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!lc.shutdown.is_cancelled());

    let shutdown = lc.shutdown.clone();
    assert_eventually(
        || shutdown.is_cancelled(),
        Duration::from_secs(10 * 60),
        "shutdown should follow the drain",
    )
    .await;
    assert!(lc.agent.control.response_for("t1").is_some());
    assert_eq!(lc.store.inbox(WATCHER_KEY), vec!["paused".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_resume_cancels_pending_drain() {
    let lc = lifecycle(Behavior::Sleep(Duration::from_secs(30)), true);
    lc.agent.engine.execute(long_running("t1")).await;

    lc.controller
        .handle_command(LifecycleCommand::StopAcquiring)
        .await;
    lc.controller.handle_command(LifecycleCommand::Resume).await;

    assert!(lc.agent.services.heartbeat.is_accepting());
    assert_eq!(*lc.phase.borrow(), LifecyclePhase::Running);

    let control = lc.agent.control.clone();
    assert_eventually(
        || control.response_for("t1").is_some(),
        Duration::from_secs(5 * 60),
        "t1 should finish",
    )
    .await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!lc.shutdown.is_cancelled());
    assert!(lc.store.inbox(WATCHER_KEY).is_empty());
}

#[tokio::test]
async fn test_self_destruct_reported_in_status() {
    let lc = lifecycle(Behavior::Succeed(String::new()), false);
    lc.agent.services.heartbeat.initiate_self_destruct();

    lc.controller.report_status().await;

    assert_eq!(*lc.phase.borrow(), LifecyclePhase::SelfDestructed);
    let entry = lc.store.entry(lc.controller.key());
    assert_eq!(entry["self-destruct"], json!(true));
    assert_eq!(entry["accepting-tasks"], json!(false));
    assert_eq!(entry["phase"], json!("self-destructed"));
    assert_eq!(entry["version"], json!("1.0.0"));
    assert!(entry["perf"]["pools"].is_array());
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_command_and_signals_watcher() {
    let lc = lifecycle(Behavior::Succeed(String::new()), true);
    std::fs::create_dir(lc.scripts.path().join("backup.0.9.0")).unwrap();
    let (commands_tx, commands) = mpsc::unbounded_channel();

    let handle = tokio::spawn(Arc::clone(&lc.controller).run(commands, Vec::new()));
    let phase = lc.phase.clone();
    assert_eventually(
        || *phase.borrow() == LifecyclePhase::Running,
        Duration::from_secs(1),
        "controller should be running",
    )
    .await;

    commands_tx.send(LifecycleCommand::Stop).unwrap();
    handle.await.unwrap();

    assert!(lc.shutdown.is_cancelled());
    assert_eq!(*lc.phase.borrow(), LifecyclePhase::Stopped);
    assert_eq!(lc.store.entry(lc.controller.key())["phase"], json!("stopped"));
    assert_eq!(lc.store.inbox(WATCHER_KEY), vec!["stopped".to_string()]);
    assert!(!lc.scripts.path().join("backup.0.9.0").exists());
}

#[tokio::test(start_paused = true)]
async fn test_run_applies_pending_watcher_messages() {
    let lc = lifecycle(Behavior::Succeed(String::new()), true);
    let (_commands_tx, commands) = mpsc::unbounded_channel();

    let handle = tokio::spawn(
        Arc::clone(&lc.controller).run(commands, vec![WatcherMessage::StopAcquiring]),
    );

    let shutdown = lc.shutdown.clone();
    assert_eventually(
        || shutdown.is_cancelled(),
        Duration::from_secs(5),
        "an idle agent should stop right after stop-acquiring",
    )
    .await;
    handle.await.unwrap();
    assert_eq!(
        lc.store.inbox(WATCHER_KEY),
        vec!["paused".to_string(), "stopped".to_string()]
    );
}

// =============================================================================
// Startup Profile
// =============================================================================

#[tokio::test]
async fn test_profile_applied_then_unchanged_then_removed() {
    let dir = tempfile::tempdir().unwrap();
    let control = FakeControlPlane::new();
    let services = test_harness::test_services(Arc::clone(&control), RunnerRegistry::new());
    let checker = ProfileChecker::new(
        services,
        ShellRunner::new(),
        dir.path().join("profile.json"),
        Duration::from_secs(30),
    );

    control.set_profile(Some(Profile {
        profile_id: "p1".into(),
        name: "base".into(),
        script: "echo provisioned".into(),
        updated_at: 100,
    }));
    assert_eq!(
        checker.check().await.unwrap(),
        ProfileCheck::Applied { failed: false }
    );
    let stored = checker.stored().await.unwrap().unwrap();
    assert_eq!(stored.profile_id, "p1");
    assert_eq!(stored.updated_at, 100);
    assert_eq!(
        control.profile_results.lock().unwrap().clone(),
        vec![(false, "provisioned\n".to_string())]
    );

    control.set_profile(None);
    assert_eq!(checker.check().await.unwrap(), ProfileCheck::Unchanged);

    control.set_profile(Some(Profile {
        profile_id: NO_PROFILE.into(),
        name: String::new(),
        script: String::new(),
        updated_at: 0,
    }));
    assert_eq!(checker.check().await.unwrap(), ProfileCheck::Removed);
    assert!(checker.stored().await.unwrap().is_none());

    assert_eq!(
        control.profile_checks.lock().unwrap().clone(),
        vec![
            (NO_PROFILE.to_string(), 0),
            ("p1".to_string(), 100),
            ("p1".to_string(), 100),
        ]
    );
}

#[tokio::test]
async fn test_failed_profile_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let control = FakeControlPlane::new();
    let services = test_harness::test_services(Arc::clone(&control), RunnerRegistry::new());
    let checker = ProfileChecker::new(
        services,
        ShellRunner::new(),
        dir.path().join("profile.json"),
        Duration::from_secs(30),
    );

    control.set_profile(Some(Profile {
        profile_id: "p2".into(),
        name: "broken".into(),
        script: "echo nope >&2; exit 2".into(),
        updated_at: 7,
    }));
    assert_eq!(
        checker.check().await.unwrap(),
        ProfileCheck::Applied { failed: true }
    );
    assert!(checker.stored().await.unwrap().unwrap().failed);
    let results = control.profile_results.lock().unwrap().clone();
    assert!(results[0].0);
    assert!(results[0].1.contains("nope"));
}
