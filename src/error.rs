use std::time::Duration;

use thiserror::Error;

use crate::task::Owner;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Control plane call timed out after {0:?}")]
    Timeout(Duration),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Secret decryption failed: {0}")]
    SecretDecryption(String),

    #[error("Unsupported task type: {0}")]
    UnsupportedTaskType(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A task package arrived but could not be turned into a runnable task.
    #[error("Task package {task_id} is unusable: {source}")]
    PackageDecode {
        task_id: String,
        owner: Owner,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Registration abandoned: agent is no longer acquiring tasks")]
    RegistrationAbandoned,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Network-level failures that the owning timer retries on its next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Timeout(_) | AgentError::TransportError(_) => true,
            AgentError::GrpcError(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::Aborted
            ),
            _ => false,
        }
    }

    /// The decode failure of a package owned by `agent_id`, which must be reported.
    pub fn undecodable_package_of(&self, agent_id: &str) -> Option<&AgentError> {
        match self {
            AgentError::PackageDecode { owner, source, .. } if owner.is_agent(agent_id) => {
                Some(source)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
