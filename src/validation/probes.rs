use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{AgentError, Result};
use crate::task::Capability;

/// Checks one capability. A probe never fails: unreachable means `false`.
#[tonic::async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn probe(&self, capability: &Capability) -> bool;
}

/// Probes capabilities against the real network and filesystem.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    http: reqwest::Client,
    timeout: Duration,
}

impl NetworkProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, timeout })
    }

    async fn probe_http(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(response) => {
                tracing::debug!(url = %url, status = %response.status(), "HTTP capability reachable");
                true
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "HTTP capability unreachable");
                false
            }
        }
    }

    async fn probe_tcp(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    async fn probe_executable(name: &str) -> bool {
        let name = name.to_string();
        tokio::task::spawn_blocking(move || which::which(name).is_ok())
            .await
            .unwrap_or(false)
    }
}

#[tonic::async_trait]
impl CapabilityProbe for NetworkProbe {
    async fn probe(&self, capability: &Capability) -> bool {
        match capability {
            Capability::Http { url } => self.probe_http(url).await,
            Capability::Tcp { host, port } => self.probe_tcp(host, *port).await,
            Capability::Executable { name } => Self::probe_executable(name).await,
        }
    }
}
