use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::connection::ConnectionManager;
use crate::context::AgentIdentity;
use crate::control::{ControlPlane, GrpcControlPlane};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::dispatch::TaskDispatcher;
use crate::error::{AgentError, Result};
use crate::heartbeat::HeartbeatState;
use crate::lifecycle::{
    agent_key, await_go_ahead, register, FileStatusStore, LifecycleController, LifecyclePhase,
    ProfileChecker, StatusStore,
};
use crate::secrets::{KeyringDecryptor, SanitizerRegistry, SecretDecryptor, SecretInjector};
use crate::services::AgentServices;
use crate::task::TaskTracker;
use crate::tls::TlsIdentity;
use crate::validation::{CapabilityProbe, NetworkProbe, ValidationExecutor};
use crate::worker::{ExecutionEngine, ExecutorPools, RunnerRegistry, ShellRunner};

/// The worker agent: owns its collaborators until [`run`](Agent::run) wires them together.
pub struct Agent {
    config: AgentConfig,
    control: Arc<dyn ControlPlane>,
    store: Arc<dyn StatusStore>,
    runners: Arc<RunnerRegistry>,
    probe: Arc<dyn CapabilityProbe>,
    decryptor: Arc<dyn SecretDecryptor>,
    heartbeat: Arc<HeartbeatState>,
    phase: watch::Sender<LifecyclePhase>,
}

impl Agent {
    /// Agent with the built-in shell runner, network probes and keyring decryption.
    pub fn new(
        config: AgentConfig,
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn StatusStore>,
    ) -> Result<Self> {
        let probe = NetworkProbe::new(config.execution.probe_timeout())?;
        let keys = config
            .keyring
            .iter()
            .map(|(id, key)| (id.clone(), SecretString::from(key.expose_secret().to_string())))
            .collect();
        let decryptor = KeyringDecryptor::new(keys);
        let (phase, _) = watch::channel(LifecyclePhase::Starting);
        Ok(Self {
            runners: Arc::new(RunnerRegistry::new().with(Arc::new(ShellRunner::new()))),
            probe: Arc::new(probe),
            decryptor: Arc::new(decryptor),
            heartbeat: Arc::new(HeartbeatState::default()),
            config,
            control,
            store,
            phase,
        })
    }

    /// Agent talking gRPC to `config.manager_url`, with its status store under the data directory.
    pub async fn connect(config: AgentConfig) -> Result<Self> {
        config.validate()?;

        let tls = if config.tls.is_complete() {
            match TlsIdentity::load(&config.tls).await {
                Ok(identity) => {
                    tracing::info!("TLS enabled with mTLS authentication");
                    Some(identity.client_tls_config())
                }
                Err(e) if config.tls.allow_insecure => {
                    tracing::warn!(error = %e, "TLS certificate loading failed, running in insecure mode");
                    None
                }
                Err(e) => {
                    return Err(AgentError::Config(format!(
                        "TLS certificate loading failed: {}",
                        e
                    )))
                }
            }
        } else if config.tls.enabled {
            if !config.tls.allow_insecure {
                return Err(AgentError::Config(
                    "TLS enabled but missing required paths (ca_cert, cert, key)".into(),
                ));
            }
            tracing::warn!("TLS enabled but certificate paths incomplete, running in insecure mode");
            None
        } else {
            None
        };

        let control = GrpcControlPlane::new(
            &config.manager_url,
            config.agent_token.as_ref(),
            tls,
            config.connection.rpc_timeout(),
            Duration::from_millis(config.execution.default_task_timeout_ms),
        )?;
        let store = FileStatusStore::open(config.status_dir(), config.inbox_dir()).await?;

        Self::new(config, Arc::new(control), Arc::new(store))
    }

    pub fn with_runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = Arc::new(runners);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn SecretDecryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn heartbeat(&self) -> Arc<HeartbeatState> {
        Arc::clone(&self.heartbeat)
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    /// Run the agent until `shutdown` is cancelled.
    ///
    /// 1. Handshakes with the watcher, if one supervises this process
    /// 2. Registers with the control plane
    /// 3. Spawns the control channel and, if configured, the status server
    /// 4. Runs the lifecycle timers until shutdown
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::RegistrationAbandoned`] when the agent was disabled
    /// before it could register.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Agent {
            config,
            control,
            store,
            runners,
            probe,
            decryptor,
            heartbeat,
            phase,
        } = self;
        let config = &config;
        let key = agent_key(std::process::id());

        let pending = if config.lifecycle.watched {
            await_go_ahead(store.as_ref(), &key, config.lifecycle.go_ahead_timeout()).await
        } else {
            Vec::new()
        };

        phase.send_replace(LifecyclePhase::Registering);
        let identity = AgentIdentity::new(config, runners.task_types());
        let Some(ctx) = register(
            control.as_ref(),
            &identity,
            &heartbeat,
            config.lifecycle.registration_retry(),
            config.connection.rpc_timeout(),
            &shutdown,
        )
        .await?
        else {
            phase.send_replace(LifecyclePhase::Stopped);
            return Ok(());
        };

        let services = AgentServices {
            ctx,
            control,
            tracker: Arc::new(TaskTracker::new()),
            pools: Arc::new(ExecutorPools::new(&config.pools)),
            runners: Arc::clone(&runners),
            sanitizers: Arc::new(SanitizerRegistry::new()),
            heartbeat,
            rpc_timeout: config.connection.rpc_timeout(),
        };

        let engine = Arc::new(ExecutionEngine::new(
            services.clone(),
            SecretInjector::new(decryptor),
            config.execution.clone(),
        ));
        let validator = Arc::new(ValidationExecutor::new(
            services.clone(),
            probe,
            Arc::clone(&engine),
            &config.execution,
            config.connection.poll_interval(),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            services.clone(),
            validator,
            engine,
            Duration::from_millis(config.execution.max_backlog_delay_ms),
        ));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionManager::new(
            services.clone(),
            dispatcher,
            config.connection.clone(),
            config.lifecycle.supervisor_sentinel.clone(),
            commands_tx,
        ));
        let profile = Arc::new(ProfileChecker::new(
            services.clone(),
            ShellRunner::new(),
            config.data_dir.join("profile.json"),
            Duration::from_millis(config.lifecycle.profile_run_timeout_ms),
        ));

        if let Some(addr) = config.status_addr {
            let state = DashboardState {
                services: services.clone(),
                phase: phase.subscribe(),
                channel: connection.subscribe(),
                heartbeat_timeout: config.connection.heartbeat_timeout(),
                sentinel: config.lifecycle.supervisor_sentinel.clone(),
            };
            tokio::spawn(run_dashboard(addr, state, shutdown.clone()));
        }

        tracing::info!(
            agent_id = %services.ctx.agent_id,
            connection_id = %services.ctx.connection_id,
            polling = services.ctx.polling_mode,
            task_types = ?runners.task_types(),
            "Agent started"
        );

        let channel = tokio::spawn(Arc::clone(&connection).run(shutdown.clone()));

        let controller = Arc::new(LifecycleController::new(
            services,
            connection,
            store,
            profile,
            phase,
            config,
            shutdown,
        ));
        controller.run(commands_rx, pending).await;

        match channel.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Control channel stopped with an error"),
            Err(e) => tracing::error!(error = %e, "Control channel task failed"),
        }
        Ok(())
    }
}
