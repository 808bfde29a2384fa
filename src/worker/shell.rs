use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::runner::{ExecutionResult, TaskContext, TaskRunner};
use crate::error::{AgentError, Result};
use crate::task::{Capability, TaskParameters, TaskStatus, SHELL_SCRIPT};

/// Runs `SHELL_SCRIPT` tasks with `sh -c`.
///
/// The child is killed when the task is cancelled or its future is dropped.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Execute `script`, capturing stdout and stderr.
    pub async fn run_script(
        &self,
        task_id: &str,
        script: &str,
        env: &BTreeMap<String, String>,
        working_directory: Option<&Path>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(task_id = %task_id, "Executing shell script");

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_directory {
            command.current_dir(dir);
        }

        let result = tokio::select! {
            result = command.output() => result,
            _ = cancel.cancelled() => {
                tracing::info!(task_id = %task_id, "Shell script cancelled");
                return ExecutionResult::aborted();
            }
        };

        Self::process_output(task_id, result)
    }

    fn process_output(
        task_id: &str,
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let (status, error) = if output.status.success() {
                    (TaskStatus::Success, None)
                } else {
                    (
                        TaskStatus::Failure,
                        Some(if stderr.is_empty() {
                            format!("Exit code: {:?}", exit_code)
                        } else {
                            stderr.clone()
                        }),
                    )
                };

                tracing::info!(
                    task_id = %task_id,
                    status = %status,
                    exit_code = ?exit_code,
                    "Shell script finished"
                );

                ExecutionResult {
                    status,
                    exit_code,
                    output: if stdout.is_empty() {
                        None
                    } else {
                        Some(stdout)
                    },
                    error,
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to spawn shell");
                ExecutionResult::failure(e.to_string())
            }
        }
    }
}

#[tonic::async_trait]
impl TaskRunner for ShellRunner {
    fn task_type(&self) -> &str {
        SHELL_SCRIPT
    }

    fn legacy_criteria(&self, _parameters: &TaskParameters) -> Vec<Capability> {
        vec![Capability::Executable {
            name: self.shell.clone(),
        }]
    }

    async fn run(&self, ctx: TaskContext) -> Result<ExecutionResult> {
        let params = ctx.parameters.as_shell().ok_or_else(|| {
            AgentError::TaskExecution("shell task without shell parameters".to_string())
        })?;

        let result = self
            .run_script(
                &ctx.task_id,
                &params.script,
                &params.process_environment(),
                params.working_directory.as_deref().map(Path::new),
                &ctx.cancel,
            )
            .await;
        if let Some(error) = &result.error {
            ctx.log.warn(error);
        }
        Ok(result)
    }
}
