//! The control-plane contract as seen by the agent.
//!
//! [`ControlPlane`] is implemented over gRPC by [`GrpcControlPlane`]; tests
//! substitute an in-memory implementation. Callers wrap every call in
//! [`bounded`] so a hung control plane can never stall a timer.

pub mod grpc;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::context::{AgentContext, AgentIdentity};
use crate::error::{AgentError, Result};
use crate::task::{TaskEvent, TaskPackage, TaskResponse, ValidationResult};

pub use grpc::GrpcControlPlane;

/// Control plane's answer to a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered { agent_id: String },
    SelfDestruct,
    Migrate { url: String },
}

/// Status sent as a heartbeat and on every (re)connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub account_id: String,
    pub connection_id: String,
    pub hostname: String,
    pub version: String,
    pub sent_at_ms: i64,
    pub executing_task_ids: Vec<String>,
    pub polling_mode: bool,
}

impl AgentStatus {
    pub fn new(ctx: &AgentContext, executing_task_ids: Vec<String>, sent_at_ms: i64) -> Self {
        Self {
            agent_id: ctx.agent_id.clone(),
            account_id: ctx.account_id.clone(),
            connection_id: ctx.connection_id.clone(),
            hostname: ctx.hostname.clone(),
            version: ctx.version.clone(),
            sent_at_ms,
            executing_task_ids,
            polling_mode: ctx.polling_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub agent_id: String,
    /// The agent record was deleted along with its account
    pub record_deleted: bool,
}

/// Inbound payload of the duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Task(TaskEvent),
    HeartbeatAck { agent_id: String },
    /// `None` is a broadcast to every agent of the account
    SelfDestruct { agent_id: Option<String> },
    Migrate { url: String },
    StopAcquiring,
}

/// Why the duplex stream broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// Network or TLS level; the stream is reopened with backoff
    Transport(String),
    /// Anything else; the agent needs a restart
    Fatal(String),
}

impl std::fmt::Display for StreamFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFault::Transport(reason) => write!(f, "transport fault: {}", reason),
            StreamFault::Fatal(reason) => write!(f, "fatal fault: {}", reason),
        }
    }
}

pub type InboundStream =
    Pin<Box<dyn Stream<Item = std::result::Result<ControlMessage, StreamFault>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeScripts {
    pub version: String,
    /// File name to contents
    pub scripts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub profile_id: String,
    pub name: String,
    pub script: String,
    pub updated_at: i64,
}

#[tonic::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register_agent(&self, identity: &AgentIdentity) -> Result<RegistrationOutcome>;

    async fn heartbeat(&self, status: &AgentStatus) -> Result<HeartbeatAck>;

    async fn connection_heartbeat(&self, ctx: &AgentContext, alive: bool) -> Result<()>;

    async fn poll_task_events(&self, ctx: &AgentContext) -> Result<Vec<TaskEvent>>;

    async fn acquire_task_package(
        &self,
        ctx: &AgentContext,
        task_id: &str,
    ) -> Result<Option<TaskPackage>>;

    async fn report_validation_results(
        &self,
        ctx: &AgentContext,
        task_id: &str,
        results: &[ValidationResult],
    ) -> Result<Option<TaskPackage>>;

    async fn fail_if_all_agents_failed(&self, ctx: &AgentContext, task_id: &str) -> Result<()>;

    /// Returns whether the control plane accepted the response.
    async fn report_task_response(&self, ctx: &AgentContext, response: &TaskResponse)
        -> Result<bool>;

    async fn get_upgrade_scripts(
        &self,
        account_id: &str,
        current_version: &str,
    ) -> Result<Option<UpgradeScripts>>;

    async fn check_profile(
        &self,
        ctx: &AgentContext,
        profile_id: &str,
        last_updated_at: i64,
    ) -> Result<Option<Profile>>;

    async fn save_profile_result(&self, ctx: &AgentContext, failed: bool, content: &str)
        -> Result<()>;

    /// Open the duplex stream. Statuses pushed into `outbound` are sent upstream.
    async fn open_stream(&self, outbound: mpsc::Receiver<AgentStatus>) -> Result<InboundStream>;

    /// Point subsequent calls at a new base URL. Open streams stay up.
    async fn migrate(&self, url: &str) -> Result<()>;
}

/// Run `call`, giving up after `limit`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout(limit)),
    }
}

/// Ensure a base URL ends with `/`.
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}
