use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;

use super::params::TaskParameters;

/// Notification that a task is ready to be picked up, or must be aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task_id: String,
    pub account_id: String,
    pub is_abort: bool,
    pub is_sync: bool,
    /// Type tag, when the control plane includes it in the event
    pub task_type: Option<String>,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            account_id: String::new(),
            is_abort: false,
            is_sync: false,
            task_type: None,
        }
    }

    pub fn abort(task_id: impl Into<String>) -> Self {
        Self {
            is_abort: true,
            ..Self::new(task_id)
        }
    }

    pub fn sync(mut self) -> Self {
        self.is_sync = true;
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }
}

/// Who currently owns a task according to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Unassigned,
    Validating,
    Assigned(String),
}

impl Owner {
    pub fn is_agent(&self, agent_id: &str) -> bool {
        matches!(self, Owner::Assigned(id) if id == agent_id)
    }
}

/// A connectivity or tooling precondition an agent must satisfy to run a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Capability {
    Http { url: String },
    Tcp { host: String, port: u16 },
    Executable { name: String },
}

impl Capability {
    /// Parse the wire form: `http` + URL, `tcp` + `host:port`, `executable` + name.
    pub fn parse(kind: &str, target: &str) -> Option<Self> {
        match kind {
            "http" => Some(Capability::Http {
                url: target.to_string(),
            }),
            "tcp" => {
                let (host, port) = target.rsplit_once(':')?;
                Some(Capability::Tcp {
                    host: host.to_string(),
                    port: port.parse().ok()?,
                })
            }
            "executable" => Some(Capability::Executable {
                name: target.to_string(),
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Capability::Http { .. } => "http",
            Capability::Tcp { .. } => "tcp",
            Capability::Executable { .. } => "executable",
        }
    }

    pub fn target(&self) -> String {
        match self {
            Capability::Http { url } => url.clone(),
            Capability::Tcp { host, port } => format!("{}:{}", host, port),
            Capability::Executable { name } => name.clone(),
        }
    }

    /// Criterion string reported back with the validation result.
    pub fn criteria(&self) -> String {
        self.target()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.target())
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub parameters: TaskParameters,
    pub capabilities: Vec<Capability>,
    pub timeout: Duration,
    pub is_async: bool,
    pub owner: Owner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub id: String,
    pub name: String,
    pub encrypted_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub id: String,
    pub name: String,
    pub kind: String,
}

/// Points a secret id at its encrypted record and owning encryption config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReference {
    pub config_id: String,
    pub record: EncryptedRecord,
}

/// Secret material shipped with a package. Nothing in here is plaintext
/// except `mask_values`, which are held as secrets.
#[derive(Debug, Default)]
pub struct SecretBundle {
    /// Secret id to encrypted reference
    pub details: HashMap<String, SecretReference>,
    pub configs: HashMap<String, EncryptionConfig>,
    /// Token placeholders must carry to be substituted for this task
    pub functor_token: i64,
    /// Extra values the control plane wants masked in task output
    pub mask_values: Vec<SecretString>,
}

/// A task's full definition plus its secret bundle.
#[derive(Debug)]
pub struct TaskPackage {
    pub account_id: String,
    pub task: Task,
    pub secrets: SecretBundle,
    /// Selects capability-framework probing over the legacy per-type criteria
    pub capability_framework: bool,
}

impl TaskPackage {
    pub fn task_id(&self) -> &str {
        &self.task.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub criteria: String,
    pub validated: bool,
    pub duration: Duration,
}

impl ValidationResult {
    pub fn new(criteria: impl Into<String>, validated: bool, duration: Duration) -> Self {
        Self {
            criteria: criteria.into(),
            validated,
            duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    TimedOut,
    Aborted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failure => write!(f, "failure"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
            TaskStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Structured outcome reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl TaskResponse {
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failure,
            exit_code: None,
            output: None,
            error: Some(error.into()),
            duration: Duration::ZERO,
        }
    }
}
