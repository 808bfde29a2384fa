use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::model::Task;
use crate::worker::pools::PoolKind;

/// Non-secret description of a tracked task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_type: String,
    pub pool: PoolKind,
    pub tracked_since: DateTime<Utc>,
}

impl TaskSummary {
    pub fn new(task: &Task, pool: PoolKind) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            pool,
            tracked_since: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validating,
    Executing,
}

/// Cancellation handle of one tracked validation or execution.
///
/// The generation distinguishes this entry from any later entry for the same id,
/// so a late completion can never remove its successor.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    generation: u64,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
struct Tracked {
    summary: TaskSummary,
    handle: TaskHandle,
}

/// In-flight task bookkeeping shared by dispatcher, validator and engine.
///
/// Each stage keeps summary and future handle in one entry, so the pair is
/// inserted and removed together. All mutation goes through atomic map operations.
#[derive(Debug, Default)]
pub struct TaskTracker {
    acquiring: DashMap<String, Arc<AtomicBool>>,
    validating: DashMap<String, Tracked>,
    executing: DashMap<String, Tracked>,
    next_generation: AtomicU64,
    peak_validating: AtomicUsize,
    peak_executing: AtomicUsize,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, task_id: &str) -> bool {
        self.acquiring.contains_key(task_id)
            || self.validating.contains_key(task_id)
            || self.executing.contains_key(task_id)
    }

    pub fn is_validating(&self, task_id: &str) -> bool {
        self.validating.contains_key(task_id)
    }

    pub fn is_executing(&self, task_id: &str) -> bool {
        self.executing.contains_key(task_id)
    }

    /// Reserve `task_id` for the duration of an acquire call.
    ///
    /// Returns `None` when the id is already being acquired, validated or executed.
    /// The other stages are checked while the acquiring slot is held.
    pub fn begin_acquire(self: &Arc<Self>, task_id: &str) -> Option<AcquireGuard> {
        match self.acquiring.entry(task_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                if self.validating.contains_key(task_id) || self.executing.contains_key(task_id) {
                    return None;
                }
                let aborted = Arc::new(AtomicBool::new(false));
                slot.insert(aborted.clone());
                Some(AcquireGuard {
                    tracker: Arc::clone(self),
                    task_id: task_id.to_string(),
                    aborted,
                })
            }
        }
    }

    pub fn begin_validation(&self, summary: TaskSummary) -> Option<TaskHandle> {
        if self.executing.contains_key(&summary.task_id) {
            return None;
        }
        let handle = self.track(&self.validating, summary)?;
        update_peak(&self.peak_validating, self.validating.len());
        Some(handle)
    }

    pub fn begin_execution(&self, summary: TaskSummary) -> Option<TaskHandle> {
        if self.validating.contains_key(&summary.task_id) {
            return None;
        }
        let handle = self.track(&self.executing, summary)?;
        update_peak(&self.peak_executing, self.executing.len());
        Some(handle)
    }

    /// Move the validation entry owned by `validation` straight into the executing map.
    ///
    /// The entry keeps its cancel token, so an abort at any point reaches the
    /// execution. Returns `None` if the entry was aborted or replaced, or the id
    /// is already executing.
    pub fn promote_to_execution(
        &self,
        validation: &TaskHandle,
        summary: TaskSummary,
    ) -> Option<TaskHandle> {
        let Entry::Occupied(validating) = self.validating.entry(summary.task_id.clone()) else {
            return None;
        };
        if validating.get().handle.generation != validation.generation {
            return None;
        }
        let handle = match self.executing.entry(summary.task_id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                let handle = TaskHandle {
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    cancel: validation.cancel.clone(),
                };
                slot.insert(Tracked {
                    summary,
                    handle: handle.clone(),
                });
                handle
            }
        };
        validating.remove();
        update_peak(&self.peak_executing, self.executing.len());
        Some(handle)
    }

    fn track(&self, map: &DashMap<String, Tracked>, summary: TaskSummary) -> Option<TaskHandle> {
        match map.entry(summary.task_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = TaskHandle {
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    cancel: CancellationToken::new(),
                };
                slot.insert(Tracked {
                    summary,
                    handle: handle.clone(),
                });
                Some(handle)
            }
        }
    }

    /// Remove the validation entry owned by `handle`. True only for the caller that removed it.
    pub fn finish_validation(&self, task_id: &str, handle: &TaskHandle) -> bool {
        self.validating
            .remove_if(task_id, |_, t| t.handle.generation == handle.generation)
            .is_some()
    }

    /// Remove the execution entry owned by `handle`. True only for the caller that removed it.
    pub fn finish_execution(&self, task_id: &str, handle: &TaskHandle) -> bool {
        self.executing
            .remove_if(task_id, |_, t| t.handle.generation == handle.generation)
            .is_some()
    }

    /// Cancel and forget everything tracked for `task_id`. Safe for unknown ids.
    ///
    /// Returns the stages that were cancelled.
    pub fn abort(&self, task_id: &str) -> Vec<Stage> {
        let mut cancelled = Vec::new();
        if let Some(aborted) = self.acquiring.get(task_id) {
            aborted.store(true, Ordering::SeqCst);
        }
        if let Some((_, tracked)) = self.validating.remove(task_id) {
            tracked.handle.cancel.cancel();
            cancelled.push(Stage::Validating);
        }
        if let Some((_, tracked)) = self.executing.remove(task_id) {
            tracked.handle.cancel.cancel();
            cancelled.push(Stage::Executing);
        }
        cancelled
    }

    pub fn validating_count(&self) -> usize {
        self.validating.len()
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    /// Tasks currently validating or executing.
    pub fn backlog(&self) -> usize {
        self.validating.len() + self.executing.len()
    }

    pub fn executing_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executing.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<(Stage, TaskSummary)> {
        let mut tasks: Vec<(Stage, TaskSummary)> = self
            .validating
            .iter()
            .map(|e| (Stage::Validating, e.summary.clone()))
            .chain(
                self.executing
                    .iter()
                    .map(|e| (Stage::Executing, e.summary.clone())),
            )
            .collect();
        tasks.sort_by(|a, b| a.1.task_id.cmp(&b.1.task_id));
        tasks
    }

    /// Peak (validating, executing) counts since the previous call.
    pub fn take_peaks(&self) -> (usize, usize) {
        (
            self.peak_validating.swap(0, Ordering::Relaxed),
            self.peak_executing.swap(0, Ordering::Relaxed),
        )
    }
}

fn update_peak(peak: &AtomicUsize, current: usize) {
    peak.fetch_max(current, Ordering::Relaxed);
}

/// Holds an id in the acquiring set; released on drop.
#[derive(Debug)]
pub struct AcquireGuard {
    tracker: Arc<TaskTracker>,
    task_id: String,
    aborted: Arc<AtomicBool>,
}

impl AcquireGuard {
    /// An abort arrived while the package was being acquired.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        self.tracker.acquiring.remove(&self.task_id);
    }
}
