use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::control::normalize_base_url;

/// Wall-clock milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Heartbeat timestamps and lifecycle flags.
///
/// Written by the timer that owns each flag and read by everyone else,
/// so every field is an atomic.
#[derive(Debug)]
pub struct HeartbeatState {
    acquire_tasks: AtomicBool,
    upgrade_pending: AtomicBool,
    upgrade_needed: AtomicBool,
    upgrade_started_ms: AtomicI64,
    shutdown_pending: AtomicBool,
    shutdown_started_ms: AtomicI64,
    restart_needed: AtomicBool,
    self_destruct: AtomicBool,
    last_sent_ms: AtomicI64,
    last_received_ms: AtomicI64,
    migrate_target: Mutex<Option<String>>,
}

/// Serializable view of [`HeartbeatState`] for the watcher and the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatSnapshot {
    pub accepting_tasks: bool,
    pub upgrade_pending: bool,
    pub upgrade_needed: bool,
    pub upgrade_started_ms: Option<i64>,
    pub shutdown_pending: bool,
    pub shutdown_started_ms: Option<i64>,
    pub restart_needed: bool,
    pub self_destruct: bool,
    pub last_heartbeat_sent_ms: i64,
    pub last_heartbeat_received_ms: i64,
    pub migrate_target: Option<String>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new(now_ms())
    }
}

fn optional(ms: i64) -> Option<i64> {
    if ms > 0 {
        Some(ms)
    } else {
        None
    }
}

impl HeartbeatState {
    /// Both heartbeat timestamps start at `now_ms` so a fresh agent is not stale.
    pub fn new(now_ms: i64) -> Self {
        Self {
            acquire_tasks: AtomicBool::new(true),
            upgrade_pending: AtomicBool::new(false),
            upgrade_needed: AtomicBool::new(false),
            upgrade_started_ms: AtomicI64::new(0),
            shutdown_pending: AtomicBool::new(false),
            shutdown_started_ms: AtomicI64::new(0),
            restart_needed: AtomicBool::new(false),
            self_destruct: AtomicBool::new(false),
            last_sent_ms: AtomicI64::new(now_ms),
            last_received_ms: AtomicI64::new(now_ms),
            migrate_target: Mutex::new(None),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.acquire_tasks.load(Ordering::SeqCst) && !self.self_destruct.load(Ordering::SeqCst)
    }

    pub fn is_upgrade_pending(&self) -> bool {
        self.upgrade_pending.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_pending(&self) -> bool {
        self.shutdown_pending.load(Ordering::SeqCst)
    }

    pub fn is_self_destructed(&self) -> bool {
        self.self_destruct.load(Ordering::SeqCst)
    }

    /// Permanently disable acquisition. Returns true on the first call only.
    pub fn initiate_self_destruct(&self) -> bool {
        self.acquire_tasks.store(false, Ordering::SeqCst);
        let first = !self.self_destruct.swap(true, Ordering::SeqCst);
        if first {
            tracing::warn!("Self-destruct initiated, no further tasks will be acquired");
        }
        first
    }

    pub fn record_sent(&self, now_ms: i64) {
        self.last_sent_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn record_received(&self, now_ms: i64) {
        self.last_received_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn flag_restart(&self) {
        self.restart_needed.store(true, Ordering::SeqCst);
    }

    /// Whether the watcher should restart the agent.
    ///
    /// Only meaningful while a supervisor manages the process.
    pub fn restart_required(&self, now_ms: i64, timeout: Duration, sentinel_present: bool) -> bool {
        if !sentinel_present {
            return false;
        }
        let limit = timeout.as_millis() as i64;
        self.restart_needed.load(Ordering::SeqCst)
            || now_ms - self.last_sent_ms.load(Ordering::SeqCst) > limit
            || now_ms - self.last_received_ms.load(Ordering::SeqCst) > limit
    }

    /// Stop accepting new dispatches. Returns true if this call made the change.
    pub fn stop_acquiring(&self, now_ms: i64) -> bool {
        let was_accepting = self.acquire_tasks.swap(false, Ordering::SeqCst);
        if !self.shutdown_pending.swap(true, Ordering::SeqCst) {
            self.shutdown_started_ms.store(now_ms, Ordering::SeqCst);
        }
        was_accepting
    }

    /// Clear upgrade, restart and shutdown flags and accept tasks again.
    pub fn resume(&self) {
        self.upgrade_pending.store(false, Ordering::SeqCst);
        self.upgrade_needed.store(false, Ordering::SeqCst);
        self.upgrade_started_ms.store(0, Ordering::SeqCst);
        self.restart_needed.store(false, Ordering::SeqCst);
        self.shutdown_pending.store(false, Ordering::SeqCst);
        self.shutdown_started_ms.store(0, Ordering::SeqCst);
        if !self.self_destruct.load(Ordering::SeqCst) {
            self.acquire_tasks.store(true, Ordering::SeqCst);
        }
    }

    pub fn begin_upgrade(&self, now_ms: i64) {
        self.upgrade_needed.store(true, Ordering::SeqCst);
        if !self.upgrade_pending.swap(true, Ordering::SeqCst) {
            self.upgrade_started_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    /// The watcher has picked up the upgrade request.
    pub fn clear_upgrade_needed(&self) {
        self.upgrade_needed.store(false, Ordering::SeqCst);
    }

    /// Record the new control-plane URL, normalised with a trailing `/`.
    pub fn set_migrate_target(&self, url: &str) -> String {
        let normalized = normalize_base_url(url);
        *self
            .migrate_target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(normalized.clone());
        normalized
    }

    pub fn migrate_target(&self) -> Option<String> {
        self.migrate_target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn snapshot(&self, now_ms: i64, timeout: Duration, sentinel_present: bool) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            accepting_tasks: self.is_accepting(),
            upgrade_pending: self.is_upgrade_pending(),
            upgrade_needed: self.upgrade_needed.load(Ordering::SeqCst),
            upgrade_started_ms: optional(self.upgrade_started_ms.load(Ordering::SeqCst)),
            shutdown_pending: self.is_shutdown_pending(),
            shutdown_started_ms: optional(self.shutdown_started_ms.load(Ordering::SeqCst)),
            restart_needed: self.restart_required(now_ms, timeout, sentinel_present),
            self_destruct: self.is_self_destructed(),
            last_heartbeat_sent_ms: self.last_sent_ms.load(Ordering::SeqCst),
            last_heartbeat_received_ms: self.last_received_ms.load(Ordering::SeqCst),
            migrate_target: self.migrate_target(),
        }
    }
}
