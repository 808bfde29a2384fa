use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinError;

use super::pools::PoolKind;
use super::runner::{ExecutionResult, TaskContext, TaskLog, TaskRunner};
use crate::config::ExecutionConfig;
use crate::error::{AgentError, Result};
use crate::secrets::{ResolvedTask, SecretInjector};
use crate::services::AgentServices;
use crate::task::{TaskHandle, TaskPackage, TaskResponse, TaskStatus, TaskSummary};

/// Runs accepted tasks in their category pool, enforces the timeout and reports the response.
///
/// An id enters the executing map when the task is submitted and leaves it
/// exactly once, through [`TaskTracker::finish_execution`] or an abort.
///
/// [`TaskTracker::finish_execution`]: crate::task::TaskTracker::finish_execution
pub struct ExecutionEngine {
    services: AgentServices,
    injector: SecretInjector,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(services: AgentServices, injector: SecretInjector, config: ExecutionConfig) -> Self {
        Self {
            services,
            injector,
            config,
        }
    }

    /// Resolve the package's secrets, then execute it.
    ///
    /// Decryption and unknown-type failures are reported as failed responses.
    pub async fn inject_and_execute(self: &Arc<Self>, package: TaskPackage) -> bool {
        let Some((runner, resolved)) = self.resolve(package).await else {
            return false;
        };
        let pool = PoolKind::for_task(&resolved.package.task);
        let summary = TaskSummary::new(&resolved.package.task, pool);
        let Some(handle) = self.services.tracker.begin_execution(summary) else {
            tracing::debug!(task_id = %resolved.package.task.id, "Task already tracked, not executing again");
            return false;
        };
        self.start(runner, resolved, handle, pool);
        true
    }

    /// Execute a task assigned to this agent after validating it here.
    ///
    /// The id stays in the validating map while secrets are resolved and moves
    /// to executing in one step, so it is never untracked in between.
    pub async fn execute_validated(
        self: &Arc<Self>,
        package: TaskPackage,
        validation: &TaskHandle,
    ) -> bool {
        let Some((runner, resolved)) = self.resolve(package).await else {
            return false;
        };
        let pool = PoolKind::for_task(&resolved.package.task);
        let summary = TaskSummary::new(&resolved.package.task, pool);
        let Some(handle) = self
            .services
            .tracker
            .promote_to_execution(validation, summary)
        else {
            tracing::info!(task_id = %resolved.package.task.id, "Task aborted before execution, dropping it");
            return false;
        };
        self.start(runner, resolved, handle, pool);
        true
    }

    /// Submit a resolved task. Returns false if the id is already validating or executing.
    pub async fn execute(self: &Arc<Self>, resolved: ResolvedTask) -> bool {
        let task = &resolved.package.task;
        let runner = match self.services.runners.get(&task.task_type) {
            Ok(runner) => runner,
            Err(e) => {
                self.report_failure(&task.id, &e).await;
                return false;
            }
        };

        let pool = PoolKind::for_task(task);
        let Some(handle) = self
            .services
            .tracker
            .begin_execution(TaskSummary::new(task, pool))
        else {
            tracing::debug!(task_id = %task.id, "Task already tracked, not executing again");
            return false;
        };
        self.start(runner, resolved, handle, pool);
        true
    }

    /// Look up the runner and decrypt secrets, reporting either failure.
    async fn resolve(&self, package: TaskPackage) -> Option<(Arc<dyn TaskRunner>, ResolvedTask)> {
        let task_id = package.task_id().to_string();
        let runner = match self.services.runners.get(&package.task.task_type) {
            Ok(runner) => runner,
            Err(e) => {
                self.report_failure(&task_id, &e).await;
                return None;
            }
        };
        match self.injector.inject(package).await {
            Ok(resolved) => Some((runner, resolved)),
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to resolve task secrets");
                self.report_failure(&task_id, &e).await;
                None
            }
        }
    }

    fn start(
        self: &Arc<Self>,
        runner: Arc<dyn TaskRunner>,
        resolved: ResolvedTask,
        handle: TaskHandle,
        pool: PoolKind,
    ) {
        let task = &resolved.package.task;
        tracing::info!(task_id = %task.id, task_type = %task.task_type, pool = %pool, "Submitting task");
        let this = Arc::clone(self);
        self.services.pools.pool(pool).spawn(async move {
            this.run_tracked(runner, resolved, handle).await;
        });
    }

    async fn run_tracked(
        &self,
        runner: Arc<dyn TaskRunner>,
        resolved: ResolvedTask,
        handle: TaskHandle,
    ) {
        let ResolvedTask { package, masking } = resolved;
        let task_id = package.task.id.clone();

        if handle.is_cancelled() {
            tracing::info!(task_id = %task_id, "Task aborted before it started");
            self.services.tracker.finish_execution(&task_id, &handle);
            return;
        }

        self.services
            .sanitizers
            .register(Arc::new(masking.sanitizer(&task_id)));
        drop(masking);

        let timeout = package.task.timeout;
        let ctx = TaskContext {
            task_id: task_id.clone(),
            account_id: package.account_id,
            parameters: package.task.parameters,
            timeout,
            log: TaskLog::new(task_id.clone(), Arc::clone(&self.services.sanitizers)),
            cancel: handle.cancel_token().child_token(),
        };

        let started = Instant::now();
        let result = self.supervise(runner, ctx, &handle, timeout).await;
        let sanitizers = &self.services.sanitizers;
        let response = TaskResponse {
            task_id: task_id.clone(),
            status: result.status,
            exit_code: result.exit_code,
            output: result.output.map(|o| sanitizers.sanitize(&o)),
            error: result.error.map(|e| sanitizers.sanitize(&e)),
            duration: started.elapsed(),
        };

        if response.status == TaskStatus::Aborted {
            tracing::info!(task_id = %task_id, "Task aborted, no response reported");
        } else {
            self.report(&response).await;
        }

        sanitizers.unregister(&task_id);
        if self.services.tracker.finish_execution(&task_id, &handle) {
            tracing::debug!(task_id = %task_id, status = %response.status, "Task finished");
        }
    }

    /// Run the body until it finishes, is aborted or outlives `timeout` plus grace.
    async fn supervise(
        &self,
        runner: Arc<dyn TaskRunner>,
        ctx: TaskContext,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> ExecutionResult {
        let task_id = ctx.task_id.clone();
        let body_cancel = ctx.cancel.clone();
        let deadline = timeout + self.config.grace();

        let mut body = tokio::spawn(async move { runner.run(ctx).await });

        let outcome = tokio::select! {
            joined = &mut body => return body_result(&task_id, joined),
            _ = handle.cancel_token().cancelled() => ExecutionResult::aborted(),
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(task_id = %task_id, timeout = ?timeout, "Task exceeded its timeout, cancelling");
                ExecutionResult::timed_out(timeout)
            }
        };

        body_cancel.cancel();
        if tokio::time::timeout(self.config.final_wait(), &mut body)
            .await
            .is_err()
        {
            tracing::warn!(task_id = %task_id, "Task body ignored cancellation, aborting it");
            body.abort();
        }
        outcome
    }

    /// Report a response, retrying rejected or failed attempts.
    pub async fn report(&self, response: &TaskResponse) -> bool {
        let attempts = self.config.report_attempts.max(1);
        let backoff = self.config.report_backoff();

        let delivered = tokio::time::timeout(self.config.report_deadline(), async {
            for attempt in 1..=attempts {
                match self
                    .services
                    .call(
                        self.services
                            .control
                            .report_task_response(&self.services.ctx, response),
                    )
                    .await
                {
                    Ok(true) => return true,
                    Ok(false) => tracing::warn!(
                        task_id = %response.task_id,
                        attempt,
                        "Task response not accepted"
                    ),
                    Err(e) => tracing::warn!(
                        task_id = %response.task_id,
                        attempt,
                        error = %e,
                        "Failed to report task response"
                    ),
                }
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if !delivered {
            tracing::error!(task_id = %response.task_id, status = %response.status, "Giving up on task response");
        }
        delivered
    }

    /// Report a task that could not be started at all.
    pub async fn report_failure(&self, task_id: &str, error: &AgentError) -> bool {
        tracing::warn!(task_id = %task_id, error = %error, "Task failed before execution");
        let message = self.services.sanitizers.sanitize(&error.to_string());
        self.report(&TaskResponse::failure(task_id, message)).await
    }
}

fn body_result(
    task_id: &str,
    joined: std::result::Result<Result<ExecutionResult>, JoinError>,
) -> ExecutionResult {
    match joined {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::warn!(task_id = %task_id, error = %e, "Task body failed");
            ExecutionResult::failure(e.to_string())
        }
        Err(e) if e.is_panic() => {
            tracing::error!(task_id = %task_id, "Task body panicked");
            ExecutionResult::failure("Task panicked during execution")
        }
        Err(_) => ExecutionResult::aborted(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_result_maps_errors() {
        let failed = tokio::spawn(async {
            Err::<ExecutionResult, _>(AgentError::TaskExecution("boom".into()))
        })
        .await;
        let result = body_result("t1", failed);
        assert_eq!(result.status, TaskStatus::Failure);
        assert!(result.error.unwrap().contains("boom"));

        let panicked = tokio::spawn(async {
            if true {
                panic!("body exploded");
            }
            Ok::<_, AgentError>(ExecutionResult::success(None))
        })
        .await;
        assert_eq!(body_result("t1", panicked).status, TaskStatus::Failure);
    }

    #[tokio::test]
    async fn test_body_result_cancelled_join_is_aborted() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, AgentError>(ExecutionResult::success(None))
        });
        handle.abort();
        assert_eq!(body_result("t1", handle.await).status, TaskStatus::Aborted);
    }
}
