//! Capability validation of unassigned tasks.
//!
//! A task nobody owns yet is probed on every candidate agent; the control plane
//! picks an owner from the reported results. One [`ValidationExecutor`] serves
//! both probe strategies, chosen per package by [`ProbeStrategy::for_package`].

pub mod probes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::ExecutionConfig;
use crate::services::AgentServices;
use crate::task::{
    Capability, TaskHandle, TaskPackage, TaskSummary, ValidationResult,
};
use crate::worker::{ExecutionEngine, PoolKind};

pub use probes::{CapabilityProbe, NetworkProbe};

/// Where a package's criteria come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// Probe the capabilities declared on the package
    CapabilityFramework,
    /// Probe the criteria the task type's runner derives from its parameters
    Legacy,
}

impl ProbeStrategy {
    pub fn for_package(package: &TaskPackage) -> Self {
        if package.capability_framework {
            ProbeStrategy::CapabilityFramework
        } else {
            ProbeStrategy::Legacy
        }
    }
}

pub struct ValidationExecutor {
    services: AgentServices,
    probe: Arc<dyn CapabilityProbe>,
    engine: Arc<ExecutionEngine>,
    probe_timeout: Duration,
    /// Wait before asking whether every agent failed validation
    failure_grace: Duration,
}

impl ValidationExecutor {
    pub fn new(
        services: AgentServices,
        probe: Arc<dyn CapabilityProbe>,
        engine: Arc<ExecutionEngine>,
        config: &ExecutionConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            services,
            probe,
            engine,
            probe_timeout: config.probe_timeout(),
            failure_grace: poll_interval + Duration::from_millis(config.validation_grace_ms),
        }
    }

    /// Start validating `package` in its category pool.
    ///
    /// Returns false if the id is already validating or executing.
    pub fn submit(self: &Arc<Self>, package: TaskPackage) -> bool {
        let pool = PoolKind::for_task(&package.task);
        let Some(handle) = self
            .services
            .tracker
            .begin_validation(TaskSummary::new(&package.task, pool))
        else {
            return false;
        };

        let this = Arc::clone(self);
        self.services.pools.pool(pool).spawn(async move {
            let task_id = package.task_id().to_string();
            let results = tokio::select! {
                results = this.validate(&package) => results,
                _ = handle.cancel_token().cancelled() => {
                    tracing::info!(task_id = %task_id, "Validation aborted");
                    this.services.tracker.finish_validation(&task_id, &handle);
                    return;
                }
            };
            this.after_validation(&task_id, handle, results).await;
        });
        true
    }

    /// Probe every criterion of `package` concurrently.
    pub async fn validate(self: &Arc<Self>, package: &TaskPackage) -> Vec<ValidationResult> {
        let task = &package.task;
        let strategy = ProbeStrategy::for_package(package);
        let criteria = match strategy {
            ProbeStrategy::CapabilityFramework => task.capabilities.clone(),
            ProbeStrategy::Legacy => match self.services.runners.get(&task.task_type) {
                Ok(runner) => runner.legacy_criteria(&task.parameters),
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Cannot validate task");
                    return vec![ValidationResult::new(task.task_type.clone(), false, Duration::ZERO)];
                }
            },
        };

        let alternative = if strategy == ProbeStrategy::Legacy && !task.capabilities.is_empty() {
            Some(self.spawn_alternative(&task.id, task.capabilities.clone()))
        } else {
            None
        };

        let results = if criteria.is_empty() {
            vec![ValidationResult::new(task.task_type.clone(), true, Duration::ZERO)]
        } else {
            run_probes(Arc::clone(&self.probe), self.probe_timeout, criteria).await
        };

        if let Some(primary) = alternative {
            let _ = primary.send(results.iter().any(|r| r.validated));
        }

        tracing::info!(
            task_id = %task.id,
            strategy = ?strategy,
            validated = results.iter().filter(|r| r.validated).count(),
            total = results.len(),
            "Validation complete"
        );
        results
    }

    /// Probe the declared capabilities in the alternative pool for comparison only.
    fn spawn_alternative(&self, task_id: &str, capabilities: Vec<Capability>) -> oneshot::Sender<bool> {
        let (tx, rx) = oneshot::channel();
        let probe = Arc::clone(&self.probe);
        let limit = self.probe_timeout;
        let task_id = task_id.to_string();

        self.services
            .pools
            .pool(PoolKind::Alternative)
            .spawn(async move {
                let alternative = run_probes(probe, limit, capabilities)
                    .await
                    .iter()
                    .any(|r| r.validated);
                let Ok(primary) = rx.await else {
                    return;
                };
                if primary != alternative {
                    tracing::error!(
                        task_id = %task_id,
                        primary,
                        alternative,
                        "Capability validation mismatch between probe strategies"
                    );
                }
            });
        tx
    }

    /// Report results, then either hand an assigned task to the engine or,
    /// when nothing validated, ask for the fleet-wide failure check.
    ///
    /// The validation entry stays tracked until one of those completes.
    async fn after_validation(
        &self,
        task_id: &str,
        handle: TaskHandle,
        results: Vec<ValidationResult>,
    ) {
        self.conclude(task_id, &handle, results).await;
        self.services.tracker.finish_validation(task_id, &handle);
    }

    async fn conclude(&self, task_id: &str, handle: &TaskHandle, results: Vec<ValidationResult>) {
        let ctx = &self.services.ctx;
        let validated = results.iter().any(|r| r.validated);

        let assigned = match self
            .services
            .call(
                self.services
                    .control
                    .report_validation_results(ctx, task_id, &results),
            )
            .await
        {
            Ok(package) => package,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to report validation results");
                if let Some(cause) = e.undecodable_package_of(&ctx.agent_id) {
                    if !handle.is_cancelled() {
                        self.engine.report_failure(task_id, cause).await;
                    }
                    return;
                }
                None
            }
        };

        if handle.is_cancelled() {
            return;
        }

        if let Some(package) = assigned {
            if package.task.owner.is_agent(&ctx.agent_id) {
                tracing::info!(task_id = %task_id, "Validated task assigned to this agent");
                self.engine.execute_validated(package, handle).await;
                return;
            }
        }

        if !validated {
            tokio::select! {
                _ = handle.cancel_token().cancelled() => {
                    tracing::info!(task_id = %task_id, "Validation aborted, skipping fleet-wide failure check");
                    return;
                }
                _ = tokio::time::sleep(self.failure_grace) => {}
            }
            if let Err(e) = self
                .services
                .call(self.services.control.fail_if_all_agents_failed(ctx, task_id))
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to request fleet-wide failure check");
            }
        }
    }
}

/// Run one probe per capability concurrently, each bounded by `limit`.
///
/// A probe that panics or times out counts as not validated.
pub async fn run_probes(
    probe: Arc<dyn CapabilityProbe>,
    limit: Duration,
    capabilities: Vec<Capability>,
) -> Vec<ValidationResult> {
    let handles: Vec<_> = capabilities
        .into_iter()
        .map(|capability| {
            let probe = Arc::clone(&probe);
            let criteria = capability.criteria();
            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let validated = matches!(
                    tokio::time::timeout(limit, probe.probe(&capability)).await,
                    Ok(true)
                );
                (validated, started.elapsed())
            });
            (criteria, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (criteria, handle) in handles {
        let (validated, duration) = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(criteria = %criteria, error = %e, "Capability probe failed");
                (false, Duration::ZERO)
            }
        };
        results.push(ValidationResult::new(criteria, validated, duration));
    }
    results
}
