use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::AgentError;
use crate::services::AgentServices;
use crate::task::{Owner, TaskEvent};
use crate::validation::ValidationExecutor;
use crate::worker::ExecutionEngine;

/// What became of one dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Abort processed; nothing is tracked for the id any more
    Aborted,
    /// Acquisition is disabled (shutdown or self-destruct)
    NotAccepting,
    /// Upgrade pending and the event is not sync
    UpgradePending,
    /// The task type has no runner
    Unsupported,
    /// The id is already being acquired, validated or executed
    Duplicate,
    /// No package: another agent got it first
    Unavailable,
    AssignedElsewhere,
    Validating,
    Executing,
    Failed,
}

/// Entry point for task and abort events from either channel topology.
pub struct TaskDispatcher {
    services: AgentServices,
    validator: Arc<ValidationExecutor>,
    engine: Arc<ExecutionEngine>,
    max_backlog_delay: Duration,
}

impl TaskDispatcher {
    pub fn new(
        services: AgentServices,
        validator: Arc<ValidationExecutor>,
        engine: Arc<ExecutionEngine>,
        max_backlog_delay: Duration,
    ) -> Self {
        Self {
            services,
            validator,
            engine,
            max_backlog_delay,
        }
    }

    pub async fn dispatch(&self, event: TaskEvent) -> DispatchOutcome {
        let task_id = event.task_id.as_str();
        let tracker = &self.services.tracker;
        let heartbeat = &self.services.heartbeat;

        if event.is_abort {
            let stages = tracker.abort(task_id);
            tracing::info!(task_id = %task_id, cancelled = ?stages, "Abort received");
            return DispatchOutcome::Aborted;
        }
        if !heartbeat.is_accepting() {
            tracing::debug!(task_id = %task_id, "Not accepting tasks, ignoring event");
            return DispatchOutcome::NotAccepting;
        }
        if heartbeat.is_upgrade_pending() && !event.is_sync {
            tracing::debug!(task_id = %task_id, "Upgrade pending, ignoring async event");
            return DispatchOutcome::UpgradePending;
        }
        if let Some(task_type) = &event.task_type {
            if !self.services.runners.supports(task_type) {
                tracing::warn!(task_id = %task_id, task_type = %task_type, "Unsupported task type");
                return DispatchOutcome::Unsupported;
            }
        }

        let Some(guard) = tracker.begin_acquire(task_id) else {
            tracing::debug!(task_id = %task_id, "Duplicate task event");
            return DispatchOutcome::Duplicate;
        };

        let delay = backlog_delay(tracker.backlog(), self.max_backlog_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let ctx = &self.services.ctx;
        let package = match self
            .services
            .call(self.services.control.acquire_task_package(ctx, task_id))
            .await
        {
            Ok(Some(package)) => package,
            Ok(None) => {
                tracing::debug!(task_id = %task_id, "Task package unavailable");
                return DispatchOutcome::Unavailable;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to acquire task package");
                if let Some(cause) = e.undecodable_package_of(&ctx.agent_id) {
                    if guard.is_aborted() {
                        return DispatchOutcome::Aborted;
                    }
                    self.engine.report_failure(task_id, cause).await;
                }
                return DispatchOutcome::Failed;
            }
        };

        if guard.is_aborted() {
            tracing::info!(task_id = %task_id, "Task aborted while acquiring");
            return DispatchOutcome::Aborted;
        }

        let task_type = package.task.task_type.clone();
        if !self.services.runners.supports(&task_type) {
            let error = AgentError::UnsupportedTaskType(task_type);
            if package.task.owner.is_agent(&ctx.agent_id) {
                self.engine.report_failure(task_id, &error).await;
            } else {
                tracing::warn!(task_id = %task_id, error = %error, "Skipping task");
            }
            return DispatchOutcome::Unsupported;
        }

        let outcome = if package.task.owner.is_agent(&ctx.agent_id) {
            if self.engine.inject_and_execute(package).await {
                DispatchOutcome::Executing
            } else {
                DispatchOutcome::Failed
            }
        } else if let Owner::Assigned(owner) = &package.task.owner {
            tracing::debug!(task_id = %task_id, owner = %owner, "Task assigned to another agent");
            DispatchOutcome::AssignedElsewhere
        } else if self.validator.submit(package) {
            DispatchOutcome::Validating
        } else {
            DispatchOutcome::Duplicate
        };
        drop(guard);
        outcome
    }
}

/// Randomized pre-acquire delay growing with the backlog, capped at `max`.
pub fn backlog_delay(backlog: usize, max: Duration) -> Duration {
    if backlog == 0 || max.is_zero() {
        return Duration::ZERO;
    }
    let ceiling = max.as_millis() as u64 / 10 * backlog.min(10) as u64;
    let floor = ceiling / 2;
    Duration::from_millis(rand::thread_rng().gen_range(floor..=ceiling))
}
