use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::secrets::SanitizerRegistry;
use crate::task::{Capability, TaskParameters, TaskStatus};

/// Outcome of a task body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: Option<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            exit_code: None,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            exit_code: None,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            status: TaskStatus::TimedOut,
            exit_code: None,
            output: None,
            error: Some(format!("Task cancelled after {:?}", after)),
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: TaskStatus::Aborted,
            exit_code: None,
            output: None,
            error: Some("Task aborted".to_string()),
        }
    }
}

/// Log handle given to a task body. Every line is masked before it reaches `tracing`.
#[derive(Debug, Clone)]
pub struct TaskLog {
    task_id: String,
    sanitizers: Arc<SanitizerRegistry>,
}

impl TaskLog {
    pub fn new(task_id: impl Into<String>, sanitizers: Arc<SanitizerRegistry>) -> Self {
        Self {
            task_id: task_id.into(),
            sanitizers,
        }
    }

    pub fn info(&self, line: &str) {
        tracing::info!(task_id = %self.task_id, "{}", self.sanitizers.sanitize(line));
    }

    pub fn warn(&self, line: &str) {
        tracing::warn!(task_id = %self.task_id, "{}", self.sanitizers.sanitize(line));
    }

    pub fn sanitize(&self, text: &str) -> String {
        self.sanitizers.sanitize(text)
    }
}

/// Everything a task body receives.
#[derive(Debug)]
pub struct TaskContext {
    pub task_id: String,
    pub account_id: String,
    pub parameters: TaskParameters,
    pub timeout: Duration,
    pub log: TaskLog,
    /// Cancelled on abort or once the timeout grace elapses
    pub cancel: CancellationToken,
}

/// Business logic of one task type.
#[tonic::async_trait]
pub trait TaskRunner: Send + Sync {
    fn task_type(&self) -> &str;

    /// Preconditions probed when a package selects legacy validation.
    fn legacy_criteria(&self, _parameters: &TaskParameters) -> Vec<Capability> {
        Vec::new()
    }

    async fn run(&self, ctx: TaskContext) -> Result<ExecutionResult>;
}

#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<dyn TaskRunner>) {
        self.runners.insert(runner.task_type().to_string(), runner);
    }

    pub fn with(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.register(runner);
        self
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskRunner>> {
        self.runners
            .get(task_type)
            .cloned()
            .ok_or_else(|| AgentError::UnsupportedTaskType(task_type.to_string()))
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.runners.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.runners.keys().cloned().collect();
        types.sort();
        types
    }
}
