use std::sync::Arc;
use std::time::Duration;

use crate::context::AgentContext;
use crate::control::{bounded, ControlPlane};
use crate::error::Result;
use crate::heartbeat::HeartbeatState;
use crate::secrets::SanitizerRegistry;
use crate::task::TaskTracker;
use crate::worker::{ExecutorPools, RunnerRegistry};

/// Handles shared by the dispatcher, validator, engine and timers.
///
/// Built once registration produced an [`AgentContext`]; dropped at stop.
#[derive(Clone)]
pub struct AgentServices {
    pub ctx: AgentContext,
    pub control: Arc<dyn ControlPlane>,
    pub tracker: Arc<TaskTracker>,
    pub pools: Arc<ExecutorPools>,
    pub runners: Arc<RunnerRegistry>,
    pub sanitizers: Arc<SanitizerRegistry>,
    pub heartbeat: Arc<HeartbeatState>,
    /// Bound on every ordinary control-plane call
    pub rpc_timeout: Duration,
}

impl AgentServices {
    /// Run a control-plane call under the standard timeout.
    pub async fn call<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        bounded(self.rpc_timeout, call).await
    }
}
