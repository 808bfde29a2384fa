//! Process lifecycle: watcher handshake, registration, status reports,
//! upgrades, drains and self-destruct.
//!
//! ```text
//! Starting -> Registering -> Running -> UpgradePending  -> (respawn)
//!                                   \-> ShutdownPending -> Stopped
//!                                   \-> SelfDestructed
//! ```

pub mod perf;
pub mod profile;
pub mod upgrade;
pub mod watcher;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, LifecycleConfig};
use crate::connection::ConnectionManager;
use crate::context::{AgentContext, AgentIdentity};
use crate::control::{bounded, ControlPlane, RegistrationOutcome};
use crate::error::{AgentError, Result};
use crate::heartbeat::{now_ms, HeartbeatState};
use crate::services::AgentServices;
use crate::task::TaskTracker;

pub use perf::{PerfCounters, PerfSampler};
pub use profile::{ProfileCheck, ProfileChecker, StoredProfile, NO_PROFILE};
pub use upgrade::UpgradeManager;
pub use watcher::{agent_key, AgentSignal, FileStatusStore, StatusStore, WatcherMessage, WATCHER_KEY};

const INBOX_POLL: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecyclePhase {
    Starting,
    Registering,
    Running,
    UpgradePending,
    ShutdownPending,
    Stopped,
    SelfDestructed,
}

/// Instruction for the [`LifecycleController`], from the watcher or the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    StopAcquiring,
    Resume,
    UpgradeInProgress,
    Stop,
}

impl LifecycleCommand {
    pub fn from_watcher(message: &WatcherMessage) -> Option<Self> {
        match message {
            WatcherMessage::Resume => Some(LifecycleCommand::Resume),
            WatcherMessage::StopAcquiring => Some(LifecycleCommand::StopAcquiring),
            WatcherMessage::UpgradeInProgress => Some(LifecycleCommand::UpgradeInProgress),
            WatcherMessage::GoAhead | WatcherMessage::Unknown(_) => None,
        }
    }
}

/// Register with the control plane, retrying until it answers with an agent id.
///
/// Returns `Ok(None)` when `shutdown` fires first, and
/// [`AgentError::RegistrationAbandoned`] once acquisition is disabled for good.
pub async fn register(
    control: &dyn ControlPlane,
    identity: &AgentIdentity,
    heartbeat: &HeartbeatState,
    retry: Duration,
    rpc_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<Option<AgentContext>> {
    let mut attempt = 0u32;
    loop {
        if !heartbeat.is_accepting() {
            return Err(AgentError::RegistrationAbandoned);
        }
        attempt += 1;

        match bounded(rpc_timeout, control.register_agent(identity)).await {
            Ok(RegistrationOutcome::Registered { agent_id }) => {
                tracing::info!(agent_id = %agent_id, attempt, "Agent registered");
                return Ok(Some(AgentContext::new(identity, agent_id)));
            }
            Ok(RegistrationOutcome::SelfDestruct) => {
                tracing::warn!("Registration answered with self-destruct");
                heartbeat.initiate_self_destruct();
                continue;
            }
            Ok(RegistrationOutcome::Migrate { url }) => {
                let target = heartbeat.set_migrate_target(&url);
                tracing::info!(url = %target, "Registration redirected");
                match control.migrate(&target).await {
                    Ok(()) => continue,
                    Err(e) => tracing::error!(url = %target, error = %e, "Failed to migrate"),
                }
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, retry_in = ?retry, "Registration failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

/// Announce this process to the watcher and wait for its go-ahead.
///
/// Proceeds after `timeout` without one. Returns the other messages that
/// arrived in the meantime, in order.
pub async fn await_go_ahead(
    store: &dyn StatusStore,
    key: &str,
    timeout: Duration,
) -> Vec<WatcherMessage> {
    let mut fields = Map::new();
    fields.insert("is-new".into(), Value::Bool(true));
    fields.insert("pid".into(), json!(std::process::id()));
    if let Err(e) = store.put(key, fields).await {
        tracing::warn!(error = %e, "Failed to write status entry");
    }
    if let Err(e) = store.send(WATCHER_KEY, AgentSignal::Started.as_str()).await {
        tracing::warn!(error = %e, "Failed to signal the watcher");
    }

    let deadline = Instant::now() + timeout;
    let mut pending = Vec::new();
    loop {
        match store.drain_inbox(key).await {
            Ok(lines) => {
                let mut go_ahead = false;
                for line in lines {
                    match WatcherMessage::parse(&line) {
                        WatcherMessage::GoAhead => go_ahead = true,
                        other => pending.push(other),
                    }
                }
                if go_ahead {
                    tracing::info!("Watcher go-ahead received");
                    break;
                }
            }
            Err(e) => tracing::debug!(error = %e, "Failed to read inbox"),
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(waited = ?timeout, "No go-ahead from the watcher, proceeding");
            break;
        }
        tokio::time::sleep(INBOX_POLL.min(deadline - now)).await;
    }

    if let Err(e) = store.remove_field(key, "is-new").await {
        tracing::warn!(error = %e, "Failed to clear is-new");
    }
    pending
}

/// Wait until no task is validating or executing. False when `deadline` passed first.
pub async fn wait_for_drain(tracker: &TaskTracker, deadline: Duration) -> bool {
    let limit = Instant::now() + deadline;
    loop {
        let backlog = tracker.backlog();
        if backlog == 0 {
            return true;
        }
        let now = Instant::now();
        if now >= limit {
            tracing::warn!(backlog, waited = ?deadline, "In-flight tasks did not drain in time");
            return false;
        }
        tracing::debug!(backlog, "Waiting for in-flight tasks");
        tokio::time::sleep(DRAIN_POLL.min(limit - now)).await;
    }
}

/// Owns the lifecycle timers and reacts to [`LifecycleCommand`]s.
pub struct LifecycleController {
    services: AgentServices,
    connection: Arc<ConnectionManager>,
    store: Arc<dyn StatusStore>,
    profile: Arc<ProfileChecker>,
    upgrade: UpgradeManager,
    perf: PerfSampler,
    phase: watch::Sender<LifecyclePhase>,
    config: LifecycleConfig,
    heartbeat_timeout: Duration,
    key: String,
    shutdown: CancellationToken,
    upgrade_running: AtomicBool,
    drain: Mutex<Option<CancellationToken>>,
}

impl LifecycleController {
    pub fn new(
        services: AgentServices,
        connection: Arc<ConnectionManager>,
        store: Arc<dyn StatusStore>,
        profile: Arc<ProfileChecker>,
        phase: watch::Sender<LifecyclePhase>,
        config: &AgentConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            upgrade: UpgradeManager::new(&config.lifecycle.scripts_dir, &config.version),
            services,
            connection,
            store,
            profile,
            perf: PerfSampler::new(),
            phase,
            config: config.lifecycle.clone(),
            heartbeat_timeout: config.connection.heartbeat_timeout(),
            key: agent_key(std::process::id()),
            shutdown,
            upgrade_running: AtomicBool::new(false),
            drain: Mutex::new(None),
        }
    }

    /// Status-store key of this process.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::info!(from = ?previous, to = ?phase, "Lifecycle phase changed");
        }
    }

    /// Drive the lifecycle timers until shutdown, then write the final status.
    ///
    /// `pending` holds watcher messages that arrived during the handshake.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<LifecycleCommand>,
        pending: Vec<WatcherMessage>,
    ) {
        self.set_phase(LifecyclePhase::Running);
        for message in &pending {
            if let Some(command) = LifecycleCommand::from_watcher(message) {
                self.handle_command(command).await;
            }
        }

        let config = &self.config;
        let mut status_tick = interval(Duration::from_millis(config.status_report_interval_ms));
        let upgrade_period = Duration::from_millis(config.upgrade_check_interval_ms);
        let mut upgrade_tick = interval_at(Instant::now() + upgrade_period, upgrade_period);
        let profile_period = Duration::from_millis(config.profile_check_interval_ms);
        let mut profile_tick = interval_at(Instant::now() + profile_period, profile_period);
        let mut inbox_tick = interval(INBOX_POLL);
        for ticker in [
            &mut status_tick,
            &mut upgrade_tick,
            &mut profile_tick,
            &mut inbox_tick,
        ] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        let upgrades = config.upgrade_enabled && !config.multi_version;
        if !upgrades {
            tracing::info!(multi_version = config.multi_version, "Upgrade checks disabled");
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = status_tick.tick() => self.report_status().await,
                _ = upgrade_tick.tick(), if upgrades => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.check_upgrade().await {
                            tracing::warn!(error = %e, "Upgrade check failed");
                        }
                    });
                }
                _ = profile_tick.tick() => {
                    let profile = Arc::clone(&self.profile);
                    tokio::spawn(async move {
                        if let Err(e) = profile.check().await {
                            tracing::warn!(error = %e, "Profile check failed");
                        }
                    });
                }
                _ = inbox_tick.tick(), if self.config.watched => self.poll_inbox().await,
                Some(command) = commands.recv() => self.handle_command(command).await,
            }
        }

        self.finish().await;
    }

    async fn finish(&self) {
        self.cancel_drain();
        let phase = if self.services.heartbeat.is_self_destructed() {
            LifecyclePhase::SelfDestructed
        } else {
            LifecyclePhase::Stopped
        };
        self.set_phase(phase);
        self.report_status().await;
        self.signal(AgentSignal::Stopped).await;

        if let Err(e) = self.upgrade.cleanup_backups().await {
            tracing::warn!(error = %e, "Failed to clean up script backups");
        }
        tracing::info!("Lifecycle stopped");
    }

    async fn poll_inbox(self: &Arc<Self>) {
        let lines = match self.store.drain_inbox(&self.key).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read inbox");
                return;
            }
        };
        for line in lines {
            let message = WatcherMessage::parse(&line);
            match LifecycleCommand::from_watcher(&message) {
                Some(command) => self.handle_command(command).await,
                None => tracing::debug!(message = ?message, "Ignoring watcher message"),
            }
        }
    }

    pub async fn handle_command(self: &Arc<Self>, command: LifecycleCommand) {
        tracing::info!(command = ?command, "Lifecycle command");
        let heartbeat = &self.services.heartbeat;
        match command {
            LifecycleCommand::StopAcquiring => {
                if heartbeat.is_shutdown_pending() {
                    return;
                }
                heartbeat.stop_acquiring(now_ms());
                self.set_phase(LifecyclePhase::ShutdownPending);
                self.report_status().await;

                let this = Arc::clone(self);
                self.spawn_drain(async move {
                    this.connection.pause();
                    this.signal(AgentSignal::Paused).await;
                    tracing::info!("Drained after stop-acquiring, stopping");
                    this.shutdown.cancel();
                });
            }
            LifecycleCommand::Resume => {
                self.cancel_drain();
                heartbeat.resume();
                self.connection.resume();
                if !heartbeat.is_self_destructed() {
                    self.set_phase(LifecyclePhase::Running);
                }
                self.report_status().await;
            }
            LifecycleCommand::UpgradeInProgress => {
                heartbeat.clear_upgrade_needed();
                self.report_status().await;
            }
            LifecycleCommand::Stop => self.shutdown.cancel(),
        }
    }

    /// Run `then` once in-flight tasks drained or the drain deadline passed.
    ///
    /// A later drain or a resume cancels an earlier one.
    fn spawn_drain<F>(self: &Arc<Self>, then: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let tracker = Arc::clone(&self.services.tracker);
        let deadline = self.config.drain_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Drain cancelled");
                }
                _ = wait_for_drain(&tracker, deadline) => then.await,
            }
        });
    }

    fn cancel_drain(&self) {
        if let Some(token) = self
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    /// Compare run scripts with the control plane's; on mismatch replace them,
    /// mark the upgrade pending and respawn once drained.
    ///
    /// Returns whether an upgrade started.
    pub async fn check_upgrade(self: &Arc<Self>) -> Result<bool> {
        if self.services.heartbeat.is_upgrade_pending()
            || self.upgrade_running.swap(true, Ordering::SeqCst)
        {
            return Ok(false);
        }
        let result = self.try_upgrade().await;
        self.upgrade_running.store(false, Ordering::SeqCst);
        result
    }

    async fn try_upgrade(self: &Arc<Self>) -> Result<bool> {
        let services = &self.services;
        let remote = bounded(
            self.config.script_timeout(),
            services
                .control
                .get_upgrade_scripts(&services.ctx.account_id, self.upgrade.current_version()),
        )
        .await?;
        let Some(remote) = remote else {
            return Ok(false);
        };
        if !self.upgrade.needs_upgrade(&remote).await? {
            return Ok(false);
        }

        tracing::info!(
            current = %self.upgrade.current_version(),
            target = %remote.version,
            "Upgrade required"
        );
        self.upgrade.replace_scripts(&remote).await?;
        services.heartbeat.begin_upgrade(now_ms());
        self.set_phase(LifecyclePhase::UpgradePending);
        self.report_status().await;

        let this = Arc::clone(self);
        self.spawn_drain(async move {
            if this.config.watched {
                this.signal(AgentSignal::Respawn).await;
                tracing::info!("Drained for upgrade, respawn requested");
            } else {
                tracing::info!("Drained for upgrade, stopping so the new scripts take effect");
                this.shutdown.cancel();
            }
        });
        Ok(true)
    }

    async fn signal(&self, signal: AgentSignal) {
        if !self.config.watched {
            return;
        }
        if let Err(e) = self.store.send(WATCHER_KEY, signal.as_str()).await {
            tracing::warn!(signal = signal.as_str(), error = %e, "Failed to signal the watcher");
        }
    }

    /// Write this process's status entry for the watcher.
    pub async fn report_status(&self) {
        let heartbeat = &self.services.heartbeat;
        if heartbeat.is_self_destructed() && self.phase() != LifecyclePhase::Stopped {
            self.set_phase(LifecyclePhase::SelfDestructed);
        }

        let now = now_ms();
        let sentinel = self.config.supervisor_sentinel.exists();
        let flags = heartbeat.snapshot(now, self.heartbeat_timeout, sentinel);
        let perf = self
            .perf
            .sample(&self.services.tracker, &self.services.pools);
        let watcher_stale = self.watcher_stale(now).await;

        let mut fields = Map::new();
        fields.insert("heartbeat".into(), json!(now));
        fields.insert("pid".into(), json!(std::process::id()));
        fields.insert("version".into(), json!(self.upgrade.current_version()));
        fields.insert(
            "phase".into(),
            serde_json::to_value(self.phase()).unwrap_or_default(),
        );
        fields.insert("accepting-tasks".into(), json!(flags.accepting_tasks));
        fields.insert("restart-needed".into(), json!(flags.restart_needed));
        fields.insert("upgrade-needed".into(), json!(flags.upgrade_needed));
        fields.insert("upgrade-pending".into(), json!(flags.upgrade_pending));
        fields.insert("upgrade-started".into(), json!(flags.upgrade_started_ms));
        fields.insert("shutdown-pending".into(), json!(flags.shutdown_pending));
        fields.insert("shutdown-started".into(), json!(flags.shutdown_started_ms));
        fields.insert("self-destruct".into(), json!(flags.self_destruct));
        fields.insert("migrate".into(), json!(flags.migrate_target));
        fields.insert("watcher-stale".into(), json!(watcher_stale));
        fields.insert(
            "perf".into(),
            serde_json::to_value(&perf).unwrap_or_default(),
        );

        if let Err(e) = self.store.put(&self.key, fields).await {
            tracing::warn!(error = %e, "Failed to write status entry");
        }
    }

    async fn watcher_stale(&self, now: i64) -> bool {
        if !self.config.watched {
            return false;
        }
        let entry = match self.store.get(WATCHER_KEY).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read watcher entry");
                return false;
            }
        };
        let Some(beat) = entry.get("heartbeat").and_then(Value::as_i64) else {
            return false;
        };
        let age = now - beat;
        if age > self.config.watcher_heartbeat_timeout_ms as i64 {
            tracing::warn!(age_ms = age, "Watcher heartbeat is stale");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watcher_commands() {
        assert_eq!(
            LifecycleCommand::from_watcher(&WatcherMessage::StopAcquiring),
            Some(LifecycleCommand::StopAcquiring)
        );
        assert_eq!(
            LifecycleCommand::from_watcher(&WatcherMessage::Resume),
            Some(LifecycleCommand::Resume)
        );
        assert_eq!(LifecycleCommand::from_watcher(&WatcherMessage::GoAhead), None);
    }

    #[test]
    fn test_phase_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(LifecyclePhase::UpgradePending).unwrap(),
            json!("upgrade-pending")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_drain_gives_up_at_deadline() {
        let tracker = Arc::new(TaskTracker::new());
        assert!(wait_for_drain(&tracker, Duration::from_secs(5)).await);

        tracker
            .begin_execution(crate::task::TaskSummary {
                task_id: "t1".into(),
                task_type: "SHELL_SCRIPT".into(),
                pool: crate::worker::PoolKind::Async,
                tracked_since: chrono::Utc::now(),
            })
            .unwrap();
        let start = Instant::now();
        assert!(!wait_for_drain(&tracker, Duration::from_secs(5)).await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
