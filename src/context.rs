use serde::Serialize;
use uuid::Uuid;

use crate::config::{AgentConfig, ConnectionMode};

/// What the agent announces about itself when registering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub account_id: String,
    pub hostname: String,
    pub agent_name: String,
    pub agent_type: String,
    pub version: String,
    /// Fresh for every process start
    pub connection_id: String,
    pub supported_task_types: Vec<String>,
    pub polling_mode: bool,
}

impl AgentIdentity {
    pub fn new(config: &AgentConfig, supported_task_types: Vec<String>) -> Self {
        Self {
            account_id: config.account_id.clone(),
            hostname: local_hostname(),
            agent_name: config.agent_name.clone(),
            agent_type: config.agent_type.clone(),
            version: config.version.clone(),
            connection_id: Uuid::new_v4().to_string(),
            supported_task_types,
            polling_mode: config.connection.mode == ConnectionMode::Poll,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Identity of a registered agent, handed to every component.
///
/// Created once registration succeeds; dropped when the agent stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentContext {
    pub agent_id: String,
    pub account_id: String,
    pub connection_id: String,
    pub hostname: String,
    pub version: String,
    pub polling_mode: bool,
}

impl AgentContext {
    pub fn new(identity: &AgentIdentity, agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            account_id: identity.account_id.clone(),
            connection_id: identity.connection_id.clone(),
            hostname: identity.hostname.clone(),
            version: identity.version.clone(),
            polling_mode: identity.polling_mode,
        }
    }
}
