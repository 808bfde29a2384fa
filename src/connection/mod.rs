//! The control channel: one duplex stream or a poll loop, plus heartbeats.
//!
//! Stream callbacks are turned into [`ChannelEvent`]s on one queue and handled
//! by a single loop, so channel state has exactly one writer.

pub mod backoff;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, ConnectionMode};
use crate::control::{AgentStatus, ControlMessage, StreamFault};
use crate::dispatch::TaskDispatcher;
use crate::error::{AgentError, Result};
use crate::heartbeat::now_ms;
use crate::lifecycle::LifecycleCommand;
use crate::services::AgentServices;
use crate::task::TaskEvent;

pub use backoff::FibonacciBackoff;

const OUTBOUND_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Open,
    Reconnecting,
    Paused,
    /// Closed after a fatal fault; only `resume` reopens it
    Failed,
}

#[derive(Debug)]
enum ChannelEvent {
    Message(ControlMessage),
    Fault { generation: u64, fault: StreamFault },
    Closed { generation: u64 },
    Pause,
    Resume,
}

pub struct ConnectionManager {
    services: AgentServices,
    dispatcher: Arc<TaskDispatcher>,
    config: ConnectionConfig,
    /// Present when a supervisor can restart this process
    sentinel: PathBuf,
    commands: mpsc::UnboundedSender<LifecycleCommand>,
    state: watch::Sender<ChannelState>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    outbound: tokio::sync::Mutex<Option<mpsc::Sender<AgentStatus>>>,
    pump: Mutex<Option<AbortHandle>>,
    /// Shared by every reconnect; rewound once a stream opens
    backoff: Mutex<FibonacciBackoff>,
}

impl ConnectionManager {
    pub fn new(
        services: AgentServices,
        dispatcher: Arc<TaskDispatcher>,
        config: ConnectionConfig,
        sentinel: PathBuf,
        commands: mpsc::UnboundedSender<LifecycleCommand>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            services,
            dispatcher,
            sentinel,
            commands,
            state,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbound: tokio::sync::Mutex::new(None),
            pump: Mutex::new(None),
            backoff: Mutex::new(FibonacciBackoff::new(
                Duration::from_secs(1),
                Duration::from_millis(config.max_backoff_ms),
            )),
            config,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Channel state changed");
        }
    }

    /// Close the stream (or stop polling) until [`resume`](Self::resume).
    pub fn pause(&self) {
        let _ = self.events_tx.send(ChannelEvent::Pause);
    }

    pub fn resume(&self) {
        let _ = self.events_tx.send(ChannelEvent::Resume);
    }

    /// Run the channel and heartbeat until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut events = self
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| AgentError::Internal("connection manager already running".into()))?;

        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop(shutdown.clone()));

        match self.config.mode {
            ConnectionMode::Poll => self.poll_loop(&mut events, &shutdown).await,
            ConnectionMode::Duplex => self.duplex_loop(&mut events, &shutdown).await,
        }

        heartbeat.abort();
        self.close().await;
        self.set_state(ChannelState::Idle);
        let ctx = &self.services.ctx;
        if let Err(e) = self
            .services
            .call(self.services.control.connection_heartbeat(ctx, false))
            .await
        {
            tracing::debug!(error = %e, "Failed to announce disconnect");
        }
        Ok(())
    }

    async fn poll_loop(
        &self,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.set_state(ChannelState::Open);
        tracing::info!(interval = ?self.config.poll_interval(), "Polling for task events");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = events.recv() => match event {
                    ChannelEvent::Pause => self.set_state(ChannelState::Paused),
                    ChannelEvent::Resume => self.set_state(ChannelState::Open),
                    ChannelEvent::Message(message) => self.handle_message(message).await,
                    ChannelEvent::Fault { .. } | ChannelEvent::Closed { .. } => {}
                },
                _ = ticker.tick() => {
                    if self.state() != ChannelState::Paused {
                        self.poll_once().await;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) {
        match self
            .services
            .call(self.services.control.poll_task_events(&self.services.ctx))
            .await
        {
            Ok(events) => {
                for event in events {
                    self.spawn_dispatch(event);
                }
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(error = %e, "Poll failed, retrying next tick");
            }
            Err(e) => tracing::warn!(error = %e, "Poll failed"),
        }
    }

    async fn duplex_loop(
        &self,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: &CancellationToken,
    ) {
        let mut generation = 0u64;
        let initial_attempts = if self.sentinel.exists() {
            Some(self.config.initial_connect_attempts.max(1))
        } else {
            None
        };

        if !self
            .connect(&mut generation, shutdown, initial_attempts, false)
            .await
        {
            if shutdown.is_cancelled() {
                return;
            }
            tracing::error!("Could not establish the control channel, restart needed");
            self.services.heartbeat.flag_restart();
            self.set_state(ChannelState::Failed);
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ChannelEvent::Message(message) => self.handle_message(message).await,
                ChannelEvent::Fault {
                    generation: g,
                    fault,
                } if g == generation => self.on_fault(fault, &mut generation, shutdown).await,
                ChannelEvent::Closed { generation: g } if g == generation => {
                    let fault = StreamFault::Transport("stream ended".to_string());
                    self.on_fault(fault, &mut generation, shutdown).await;
                }
                ChannelEvent::Fault { .. } | ChannelEvent::Closed { .. } => {
                    tracing::debug!("Ignoring event from a replaced stream");
                }
                ChannelEvent::Pause => {
                    self.close().await;
                    self.set_state(ChannelState::Paused);
                    tracing::info!("Control channel paused");
                }
                ChannelEvent::Resume => {
                    if matches!(self.state(), ChannelState::Paused | ChannelState::Failed) {
                        tracing::info!("Resuming control channel");
                        self.connect(&mut generation, shutdown, None, false).await;
                    }
                }
            }
        }
    }

    async fn on_fault(&self, fault: StreamFault, generation: &mut u64, shutdown: &CancellationToken) {
        if self.state() != ChannelState::Open {
            return;
        }
        match fault {
            StreamFault::Transport(reason) => {
                tracing::warn!(reason = %reason, "Control channel lost, reconnecting");
                self.close().await;
                self.set_state(ChannelState::Reconnecting);
                self.connect(generation, shutdown, None, true).await;
            }
            StreamFault::Fatal(reason) => {
                tracing::error!(reason = %reason, "Control channel failed, restart needed");
                self.services.heartbeat.flag_restart();
                self.close().await;
                self.set_state(ChannelState::Failed);
            }
        }
    }

    /// Open a stream, retrying with Fibonacci backoff.
    ///
    /// `max_attempts` of `None` retries until shutdown.
    async fn connect(
        &self,
        generation: &mut u64,
        shutdown: &CancellationToken,
        max_attempts: Option<u32>,
        delay_first: bool,
    ) -> bool {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if delay_first || attempt > 1 {
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(self.next_backoff()) => {}
                }
            }

            *generation += 1;
            match self.open(*generation).await {
                Ok(()) => {
                    tracing::info!(attempt, "Control channel open");
                    self.backoff
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .reset();
                    return true;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Failed to open control channel");
                    if max_attempts.is_some_and(|max| attempt >= max) {
                        return false;
                    }
                }
            }
        }
    }

    fn next_backoff(&self) -> Duration {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next_delay()
    }

    async fn open(&self, generation: u64) -> Result<()> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut inbound = self
            .services
            .call(self.services.control.open_stream(rx))
            .await?;
        *self.outbound.lock().await = Some(tx);

        let events = self.events_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(item) = inbound.next().await {
                let event = match item {
                    Ok(message) => ChannelEvent::Message(message),
                    Err(fault) => {
                        let _ = events.send(ChannelEvent::Fault { generation, fault });
                        return;
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(ChannelEvent::Closed { generation });
        });
        if let Some(previous) = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(pump.abort_handle())
        {
            previous.abort();
        }

        self.set_state(ChannelState::Open);
        self.send_status().await;
        Ok(())
    }

    async fn close(&self) {
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            pump.abort();
        }
        self.outbound.lock().await.take();
    }

    fn current_status(&self) -> AgentStatus {
        AgentStatus::new(
            &self.services.ctx,
            self.services.tracker.executing_ids(),
            now_ms(),
        )
    }

    /// Announce the current status on the open stream.
    async fn send_status(&self) -> bool {
        let status = self.current_status();
        let outbound = self.outbound.lock().await;
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(status) {
            Ok(()) => {
                self.services.heartbeat.record_sent(now_ms());
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to queue status on control channel");
                false
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_once().await,
            }
        }
    }

    pub async fn heartbeat_once(&self) {
        if self.state() == ChannelState::Paused {
            return;
        }
        match self.config.mode {
            ConnectionMode::Duplex => {
                self.send_status().await;
            }
            ConnectionMode::Poll => self.poll_heartbeat().await,
        }
    }

    async fn poll_heartbeat(&self) {
        let services = &self.services;
        let status = self.current_status();
        match services.call(services.control.heartbeat(&status)).await {
            Ok(ack) => {
                services.heartbeat.record_sent(now_ms());
                if ack.agent_id != services.ctx.agent_id {
                    tracing::debug!(ack_agent = %ack.agent_id, "Ignoring heartbeat ack for another agent");
                } else if ack.record_deleted {
                    tracing::warn!("Agent record deleted by the control plane");
                    services.heartbeat.initiate_self_destruct();
                } else {
                    services.heartbeat.record_received(now_ms());
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Heartbeat failed, retrying next tick");
                return;
            }
        }
        if let Err(e) = services
            .call(services.control.connection_heartbeat(&services.ctx, true))
            .await
        {
            tracing::debug!(error = %e, "Connection heartbeat failed");
        }
    }

    fn spawn_dispatch(&self, event: TaskEvent) {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            dispatcher.dispatch(event).await;
        });
    }

    async fn handle_message(&self, message: ControlMessage) {
        let services = &self.services;
        match message {
            ControlMessage::Task(event) => self.spawn_dispatch(event),
            ControlMessage::HeartbeatAck { agent_id } => {
                if agent_id == services.ctx.agent_id {
                    services.heartbeat.record_received(now_ms());
                } else {
                    tracing::debug!(agent_id = %agent_id, "Ignoring heartbeat ack for another agent");
                }
            }
            ControlMessage::SelfDestruct { agent_id } => {
                let addressed = agent_id
                    .as_deref()
                    .map_or(true, |id| id == services.ctx.agent_id);
                if addressed {
                    services.heartbeat.initiate_self_destruct();
                }
            }
            ControlMessage::Migrate { url } => {
                let target = services.heartbeat.set_migrate_target(&url);
                if let Err(e) = services.control.migrate(&target).await {
                    tracing::error!(url = %target, error = %e, "Failed to migrate control plane endpoint");
                }
            }
            ControlMessage::StopAcquiring => {
                let _ = self.commands.send(LifecycleCommand::StopAcquiring);
            }
        }
    }
}
