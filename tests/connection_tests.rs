//! Control channel tests: poll and duplex topologies, faults, heartbeats and control messages.


use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleet_agent::config::{ConnectionConfig, ConnectionMode};
use fleet_agent::connection::{ChannelState, ConnectionManager};
use fleet_agent::control::{ControlMessage, HeartbeatAck, StreamFault};
use fleet_agent::error::Result;
use fleet_agent::heartbeat::{now_ms, HeartbeatState};
use fleet_agent::lifecycle::LifecycleCommand;
use fleet_agent::task::{TaskEvent, TaskStatus};
use fleet_agent::worker::RunnerRegistry;
use test_harness::{
    assert_eventually, assigned, Behavior, ScriptedRunner, StaticProbe, TestAgent, AGENT_ID,
};

const ECHO: &str = "ECHO";

struct Harness {
    agent: TestAgent,
    connection: Arc<ConnectionManager>,
    commands: mpsc::UnboundedReceiver<LifecycleCommand>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Harness {
    async fn stop(self) -> TestAgent {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
        self.agent
    }
}

fn config(mode: ConnectionMode) -> ConnectionConfig {
    ConnectionConfig {
        mode,
        poll_interval_ms: 100,
        heartbeat_interval_ms: 1_000,
        ..Default::default()
    }
}

fn start(agent: TestAgent, config: ConnectionConfig, sentinel: PathBuf) -> Harness {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let connection = Arc::new(ConnectionManager::new(
        agent.services.clone(),
        agent.dispatcher.clone(),
        config,
        sentinel,
        commands_tx,
    ));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&connection).run(shutdown.clone()));
    Harness {
        agent,
        connection,
        commands,
        shutdown,
        handle,
    }
}

fn echo_agent() -> TestAgent {
    TestAgent::new(
        RunnerRegistry::new().with(ScriptedRunner::new(ECHO, Behavior::Succeed("ok".into()))),
        StaticProbe::new(&[]),
    )
}

fn no_sentinel() -> PathBuf {
    PathBuf::from("/nonexistent/fleet-agent/start.sh")
}

/// A poll-mode manager that is never run; heartbeats are driven by hand.
fn idle_poll_manager(agent: &TestAgent) -> (ConnectionManager, Arc<HeartbeatState>) {
    let mut services = agent.services.clone();
    let heartbeat = Arc::new(HeartbeatState::new(0));
    services.heartbeat = heartbeat.clone();
    let (commands_tx, _commands) = mpsc::unbounded_channel();
    let connection = ConnectionManager::new(
        services,
        agent.dispatcher.clone(),
        config(ConnectionMode::Poll),
        no_sentinel(),
        commands_tx,
    );
    (connection, heartbeat)
}

async fn wait_state(connection: &Arc<ConnectionManager>, state: ChannelState) {
    let connection = Arc::clone(connection);
    assert_eventually(
        move || connection.state() == state,
        Duration::from_secs(30),
        &format!("channel should reach {:?}", state),
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_mode_dispatches_events() {
    let agent = echo_agent();
    agent.control.add_package(assigned("t1", ECHO));
    agent.control.queue_poll(vec![TaskEvent::new("t1")]);
    let harness = start(agent, config(ConnectionMode::Poll), no_sentinel());

    let control = harness.agent.control.clone();
    assert_eventually(
        || control.response_for("t1").is_some(),
        Duration::from_secs(5),
        "polled task should execute",
    )
    .await;
    assert_eq!(
        control.response_for("t1").unwrap().status,
        TaskStatus::Success
    );
    assert_eq!(harness.connection.state(), ChannelState::Open);

    // Poll-mode heartbeats go through the unary calls
    assert_eventually(
        || !control.heartbeats.lock().unwrap().is_empty(),
        Duration::from_secs(5),
        "heartbeat should be sent",
    )
    .await;
    let connection = harness.connection.clone();
    let agent = harness.stop().await;
    assert_eq!(connection.state(), ChannelState::Idle);
    let alive = agent.control.connection_heartbeats.lock().unwrap().clone();
    assert_eq!(alive.first(), Some(&true));
    assert_eq!(alive.last(), Some(&false));
}

#[tokio::test(start_paused = true)]
async fn test_paused_poll_mode_stops_polling() {
    let agent = echo_agent();
    let harness = start(agent, config(ConnectionMode::Poll), no_sentinel());
    let control = harness.agent.control.clone();

    assert_eventually(
        || control.poll_calls.load(Ordering::SeqCst) > 0,
        Duration::from_secs(1),
        "poll should start",
    )
    .await;
    harness.connection.pause();
    wait_state(&harness.connection, ChannelState::Paused).await;

    let before = control.poll_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(control.poll_calls.load(Ordering::SeqCst), before);

    harness.connection.resume();
    wait_state(&harness.connection, ChannelState::Open).await;
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplex_reconnects_after_transport_fault() {
    let agent = echo_agent();
    let first = agent.control.push_stream();
    let _second = agent.control.push_stream();
    let harness = start(agent, config(ConnectionMode::Duplex), no_sentinel());
    let control = harness.agent.control.clone();

    wait_state(&harness.connection, ChannelState::Open).await;
    assert_eq!(control.open_calls.load(Ordering::SeqCst), 1);

    first
        .send(Err(StreamFault::Transport("connection reset".into())))
        .unwrap();
    assert_eventually(
        || control.open_calls.load(Ordering::SeqCst) == 2,
        Duration::from_secs(30),
        "stream should be reopened",
    )
    .await;
    wait_state(&harness.connection, ChannelState::Open).await;

    // Every (re)opened stream starts with a status announcement
    let mut outbound = control.outbound.lock().unwrap();
    assert_eq!(outbound.len(), 2);
    for rx in outbound.iter_mut() {
        let status = rx.try_recv().unwrap();
        assert_eq!(status.agent_id, AGENT_ID);
    }
    drop(outbound);

    assert!(!harness.agent.services.heartbeat.restart_required(
        now_ms(),
        Duration::from_secs(900),
        true
    ));
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fatal_fault_stops_reconnecting_until_resumed() {
    let agent = echo_agent();
    let first = agent.control.push_stream();
    let harness = start(agent, config(ConnectionMode::Duplex), no_sentinel());
    let control = harness.agent.control.clone();
    wait_state(&harness.connection, ChannelState::Open).await;

    first
        .send(Err(StreamFault::Fatal("certificate revoked".into())))
        .unwrap();
    wait_state(&harness.connection, ChannelState::Failed).await;
    assert!(harness.agent.services.heartbeat.restart_required(
        now_ms(),
        Duration::from_secs(900),
        true
    ));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(control.open_calls.load(Ordering::SeqCst), 1);

    let _second = control.push_stream();
    harness.connection.resume();
    wait_state(&harness.connection, ChannelState::Open).await;
    assert_eq!(control.open_calls.load(Ordering::SeqCst), 2);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_failure_flags_restart_when_supervised() {
    let sentinel = tempfile::NamedTempFile::new().unwrap();
    let agent = echo_agent();
    let heartbeat_config = config(ConnectionMode::Duplex);
    let attempts = heartbeat_config.initial_connect_attempts as usize;

    let mut services = agent.services.clone();
    let heartbeat = Arc::new(HeartbeatState::new(now_ms()));
    services.heartbeat = heartbeat.clone();
    let (commands_tx, _commands) = mpsc::unbounded_channel();
    let connection = Arc::new(ConnectionManager::new(
        services,
        agent.dispatcher.clone(),
        heartbeat_config,
        sentinel.path().to_path_buf(),
        commands_tx,
    ));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&connection).run(shutdown.clone()));

    wait_state(&connection, ChannelState::Failed).await;
    assert_eq!(agent.control.open_calls.load(Ordering::SeqCst), attempts);
    assert!(heartbeat.restart_required(now_ms(), Duration::from_secs(900), true));
    // Without a supervisor the flag means nothing
    assert!(!heartbeat.restart_required(now_ms(), Duration::from_secs(900), false));

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ack_for_other_agent_is_ignored() {
    let agent = echo_agent();
    let stream = agent.control.push_stream();
    let mut services = agent.services.clone();
    let heartbeat = Arc::new(HeartbeatState::new(0));
    services.heartbeat = heartbeat.clone();
    let (commands_tx, _commands) = mpsc::unbounded_channel();
    let connection = Arc::new(ConnectionManager::new(
        services,
        agent.dispatcher.clone(),
        config(ConnectionMode::Duplex),
        no_sentinel(),
        commands_tx,
    ));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&connection).run(shutdown.clone()));
    wait_state(&connection, ChannelState::Open).await;

    let received = || {
        heartbeat
            .snapshot(now_ms(), Duration::from_secs(900), false)
            .last_heartbeat_received_ms
    };

    stream
        .send(Ok(ControlMessage::HeartbeatAck {
            agent_id: "agent-9".into(),
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received(), 0);

    stream
        .send(Ok(ControlMessage::HeartbeatAck {
            agent_id: AGENT_ID.into(),
        }))
        .unwrap();
    assert_eventually(
        || received() > 0,
        Duration::from_secs(1),
        "ack for this agent should be recorded",
    )
    .await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_control_messages_over_stream() {
    let agent = echo_agent();
    agent.control.add_package(assigned("t1", ECHO));
    let stream = agent.control.push_stream();
    let mut harness = start(agent, config(ConnectionMode::Duplex), no_sentinel());
    wait_state(&harness.connection, ChannelState::Open).await;
    let control = harness.agent.control.clone();

    stream
        .send(Ok(ControlMessage::Task(TaskEvent::new("t1"))))
        .unwrap();
    assert_eventually(
        || control.response_for("t1").is_some(),
        Duration::from_secs(5),
        "streamed task should execute",
    )
    .await;

    stream
        .send(Ok(ControlMessage::Migrate {
            url: "https://manager-2.example.com".into(),
        }))
        .unwrap();
    assert_eventually(
        || !control.migrations().is_empty(),
        Duration::from_secs(1),
        "migration should be applied",
    )
    .await;
    assert_eq!(
        control.migrations(),
        vec!["https://manager-2.example.com/".to_string()]
    );

    stream.send(Ok(ControlMessage::StopAcquiring)).unwrap();
    let command = tokio::time::timeout(Duration::from_secs(1), harness.commands.recv())
        .await
        .unwrap();
    assert_eq!(command, Some(LifecycleCommand::StopAcquiring));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_self_destruct_addressing() {
    let agent = echo_agent();
    let stream = agent.control.push_stream();
    let mut services = agent.services.clone();
    let heartbeat = Arc::new(HeartbeatState::new(now_ms()));
    services.heartbeat = heartbeat.clone();
    let (commands_tx, _commands) = mpsc::unbounded_channel();
    let connection = Arc::new(ConnectionManager::new(
        services,
        agent.dispatcher.clone(),
        config(ConnectionMode::Duplex),
        no_sentinel(),
        commands_tx,
    ));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&connection).run(shutdown.clone()));
    wait_state(&connection, ChannelState::Open).await;

    stream
        .send(Ok(ControlMessage::SelfDestruct {
            agent_id: Some("agent-9".into()),
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!heartbeat.is_self_destructed());

    stream
        .send(Ok(ControlMessage::SelfDestruct { agent_id: None }))
        .unwrap();
    assert_eventually(
        || heartbeat.is_self_destructed(),
        Duration::from_secs(1),
        "broadcast self-destruct should apply",
    )
    .await;
    assert!(!heartbeat.is_accepting());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

// =============================================================================
// Poll-mode heartbeat acks
// =============================================================================

#[tokio::test]
async fn test_poll_heartbeat_deleted_ack_for_other_agent_is_ignored() {
    let agent = echo_agent();
    agent.control.set_heartbeat_ack(HeartbeatAck {
        agent_id: "some-other-agent".into(),
        record_deleted: true,
    });
    let (connection, heartbeat) = idle_poll_manager(&agent);

    connection.heartbeat_once().await;

    assert_eq!(agent.control.heartbeats.lock().unwrap().len(), 1);
    assert!(!heartbeat.is_self_destructed());
    assert!(heartbeat.is_accepting());
    let snapshot = heartbeat.snapshot(now_ms(), Duration::from_secs(900), false);
    assert!(snapshot.last_heartbeat_sent_ms > 0);
    assert_eq!(snapshot.last_heartbeat_received_ms, 0);
}

#[tokio::test]
async fn test_poll_heartbeat_deleted_ack_for_this_agent_self_destructs() {
    let agent = echo_agent();
    agent.control.set_heartbeat_ack(HeartbeatAck {
        agent_id: AGENT_ID.into(),
        record_deleted: true,
    });
    let (connection, heartbeat) = idle_poll_manager(&agent);

    connection.heartbeat_once().await;

    assert!(heartbeat.is_self_destructed());
    assert!(!heartbeat.is_accepting());
}

#[tokio::test]
async fn test_poll_heartbeat_matching_ack_records_receipt() {
    let agent = echo_agent();
    let (connection, heartbeat) = idle_poll_manager(&agent);

    connection.heartbeat_once().await;

    assert!(!heartbeat.is_self_destructed());
    let snapshot = heartbeat.snapshot(now_ms(), Duration::from_secs(900), false);
    assert!(snapshot.last_heartbeat_received_ms > 0);
    assert_eq!(
        agent.control.connection_heartbeats.lock().unwrap().as_slice(),
        &[true]
    );
}

// =============================================================================
// Reconnect backoff
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_delay_starts_over_after_successful_open() {
    let agent = echo_agent();
    let first = agent.control.push_stream();
    let harness = start(agent, config(ConnectionMode::Duplex), no_sentinel());
    let control = harness.agent.control.clone();
    wait_state(&harness.connection, ChannelState::Open).await;

    // Two failed reopen attempts (1s, 1s), then the third (2s later) succeeds
    first
        .send(Err(StreamFault::Transport("connection reset".into())))
        .unwrap();
    assert_eventually(
        || control.open_calls.load(Ordering::SeqCst) == 3,
        Duration::from_secs(30),
        "two reopen attempts should fail",
    )
    .await;
    let second = control.push_stream();
    assert_eventually(
        || control.open_calls.load(Ordering::SeqCst) == 4,
        Duration::from_secs(30),
        "third reopen attempt should succeed",
    )
    .await;
    wait_state(&harness.connection, ChannelState::Open).await;

    // The next fault waits the initial delay again, not the 3s that would follow
    let _third = control.push_stream();
    let faulted_at = tokio::time::Instant::now();
    second
        .send(Err(StreamFault::Transport("connection reset".into())))
        .unwrap();
    assert_eventually(
        || control.open_calls.load(Ordering::SeqCst) == 5,
        Duration::from_secs(30),
        "stream should be reopened",
    )
    .await;
    let waited = faulted_at.elapsed();
    assert!(waited >= Duration::from_secs(1), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(2), "waited {:?}", waited);

    harness.stop().await;
}
