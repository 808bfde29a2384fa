use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::{AgentError, Result};

/// How the agent talks to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// One persistent bidirectional stream per process.
    #[default]
    Duplex,
    /// Fixed-interval polling for task events.
    Poll,
}

/// TLS configuration for the control-plane channel.
///
/// When enabled, the agent presents its own certificate (mTLS) and verifies
/// the control plane against the configured CA.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    /// Used to verify the control plane's certificate.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this agent's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this agent's private key (PEM format).
    /// Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Domain name expected in the control plane's certificate.
    pub domain_name: Option<String>,

    /// Allow insecure connections for development/testing.
    /// When true and TLS files are missing, runs in plaintext mode with warning.
    /// When false and TLS files are missing, fails to start.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// Capacities of the named worker pools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Short synchronous tasks (the default category)
    pub sync: usize,
    /// Tasks flagged async by the control plane
    pub async_tasks: usize,
    /// Tasks whose type follows the build naming convention
    pub build: usize,
    /// Diagnostic alternative capability probes
    pub alternative: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sync: 32,
            async_tasks: 64,
            build: 8,
            alternative: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub mode: ConnectionMode,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Bound applied to every ordinary control-plane call
    pub rpc_timeout_ms: u64,
    /// A restart is flagged when no heartbeat was sent or received for this long
    pub heartbeat_timeout_ms: u64,
    /// First-connection attempts when a supervisor manages the process
    pub initial_connect_attempts: u32,
    pub max_backoff_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::Duplex,
            poll_interval_ms: 3_000,
            heartbeat_interval_ms: 30_000,
            rpc_timeout_ms: 15_000,
            heartbeat_timeout_ms: 15 * 60 * 1_000,
            initial_connect_attempts: 3,
            max_backoff_ms: 60_000,
        }
    }
}

impl ConnectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Added to a task's declared timeout before it is cancelled
    pub grace_ms: u64,
    /// Bounded wait for a cancelled task body to wind down
    pub final_wait_ms: u64,
    pub report_attempts: u32,
    pub report_backoff_ms: u64,
    /// Overall bound on reporting one task response, retries included
    pub report_deadline_ms: u64,
    /// Upper bound of the randomized pre-acquire delay
    pub max_backlog_delay_ms: u64,
    /// Added to the poll interval before asking whether all agents failed
    pub validation_grace_ms: u64,
    pub probe_timeout_ms: u64,
    /// Used when a package declares no timeout
    pub default_task_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            grace_ms: 30_000,
            final_wait_ms: 5_000,
            report_attempts: 3,
            report_backoff_ms: 200,
            report_deadline_ms: 30_000,
            max_backlog_delay_ms: 1_000,
            validation_grace_ms: 3_000,
            probe_timeout_ms: 10_000,
            default_task_timeout_ms: 10 * 60 * 1_000,
        }
    }
}

impl ExecutionConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn final_wait(&self) -> Duration {
        Duration::from_millis(self.final_wait_ms)
    }

    pub fn report_backoff(&self) -> Duration {
        Duration::from_millis(self.report_backoff_ms)
    }

    pub fn report_deadline(&self) -> Duration {
        Duration::from_millis(self.report_deadline_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Interval of the local status report written for the watcher
    pub status_report_interval_ms: u64,
    pub upgrade_check_interval_ms: u64,
    pub profile_check_interval_ms: u64,
    /// Bound on the upgrade-script download
    pub script_timeout_ms: u64,
    pub registration_retry_ms: u64,
    pub go_ahead_timeout_ms: u64,
    pub watcher_heartbeat_timeout_ms: u64,
    /// Upper bound on waiting for in-flight tasks before upgrade/shutdown proceeds
    pub drain_timeout_ms: u64,
    pub profile_run_timeout_ms: u64,
    /// Several agent versions share one deployment; upgrades are external
    pub multi_version: bool,
    pub upgrade_enabled: bool,
    /// A watcher process supervises this agent through the status store
    pub watched: bool,
    /// Directory holding the run scripts replaced on upgrade
    pub scripts_dir: PathBuf,
    /// File whose presence means a supervisor can restart this process
    pub supervisor_sentinel: PathBuf,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            status_report_interval_ms: 10_000,
            upgrade_check_interval_ms: 60_000,
            profile_check_interval_ms: 3 * 60 * 1_000,
            script_timeout_ms: 60_000,
            registration_retry_ms: 60_000,
            go_ahead_timeout_ms: 5 * 60 * 1_000,
            watcher_heartbeat_timeout_ms: 3 * 60 * 1_000,
            drain_timeout_ms: 2 * 60 * 60 * 1_000,
            profile_run_timeout_ms: 10 * 60 * 1_000,
            multi_version: false,
            upgrade_enabled: true,
            watched: false,
            scripts_dir: PathBuf::from("."),
            supervisor_sentinel: PathBuf::from("start.sh"),
        }
    }
}

impl LifecycleConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_millis(self.registration_retry_ms)
    }

    pub fn go_ahead_timeout(&self) -> Duration {
        Duration::from_millis(self.go_ahead_timeout_ms)
    }
}

/// Complete agent configuration: identity, timings, pools and credentials.
///
/// Loaded from an optional TOML file; CLI flags override individual fields.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub account_id: String,
    /// Base URL of the control plane, e.g. `https://manager.example.com:443/`
    pub manager_url: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub agent_token: Option<SecretString>,
    pub agent_name: String,
    pub agent_type: String,
    pub version: String,
    /// Working directory for the status store, profiles and task scratch space
    pub data_dir: PathBuf,
    /// Local status HTTP endpoint; disabled when unset
    pub status_addr: Option<SocketAddr>,
    pub connection: ConnectionConfig,
    pub execution: ExecutionConfig,
    pub lifecycle: LifecycleConfig,
    pub pools: PoolConfig,
    pub tls: TlsConfig,
    /// AES-256 keys (base64) by encryption-config id
    #[serde(deserialize_with = "deserialize_secret_map")]
    pub keyring: HashMap<String, SecretString>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            manager_url: String::new(),
            agent_token: None,
            agent_name: "fleet-agent".to_string(),
            agent_type: "SHELL".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("agent-data"),
            status_addr: None,
            connection: ConnectionConfig::default(),
            execution: ExecutionConfig::default(),
            lifecycle: LifecycleConfig::default(),
            pools: PoolConfig::default(),
            tls: TlsConfig::default(),
            keyring: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| AgentError::Config(e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    /// Apply deployment hints from the environment.
    pub fn apply_env(&mut self) {
        let deploy_mode = std::env::var("DEPLOY_MODE").ok();
        let multi_version = std::env::var("MULTI_VERSION").ok();
        if detect_multi_version(deploy_mode.as_deref(), multi_version.as_deref()) {
            self.lifecycle.multi_version = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(AgentError::Config("account_id is required".into()));
        }
        if self.manager_url.trim().is_empty() {
            return Err(AgentError::Config("manager_url is required".into()));
        }
        let pools = &self.pools;
        if pools.sync == 0 || pools.async_tasks == 0 || pools.build == 0 || pools.alternative == 0
        {
            return Err(AgentError::Config("pool sizes must be positive".into()));
        }
        if self.connection.poll_interval_ms == 0 || self.connection.heartbeat_interval_ms == 0 {
            return Err(AgentError::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn status_dir(&self) -> PathBuf {
        self.data_dir.join("status")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }
}

/// Kubernetes deployments and explicit multi-version installs manage upgrades externally.
pub fn detect_multi_version(deploy_mode: Option<&str>, multi_version: Option<&str>) -> bool {
    deploy_mode.is_some_and(|m| m.eq_ignore_ascii_case("KUBERNETES"))
        || multi_version.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

fn deserialize_secret_map<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(id, key)| (id, SecretString::from(key)))
        .collect())
}
