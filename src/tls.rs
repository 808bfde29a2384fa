//! Certificate loading for the control-plane channel.
//!
//! The agent is always the client: it verifies the control plane against the
//! configured CA and presents its own certificate for mutual TLS.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Agent certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Agent certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Loaded TLS materials ready for use with tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
    domain_name: Option<String>,
}

impl TlsIdentity {
    /// Load the CA, agent certificate and key named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a required path is not configured or a file cannot be read.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca = existing(
            &config.ca_cert_path,
            TlsError::MissingCaCert,
            TlsError::CaCertNotFound,
        )?;
        let cert = existing(&config.cert_path, TlsError::MissingCert, TlsError::CertNotFound)?;
        let key = existing(&config.key_path, TlsError::MissingKey, TlsError::KeyNotFound)?;

        let (ca_pem, cert_pem, key_pem) =
            tokio::try_join!(fs::read(ca), fs::read(cert), fs::read(key))?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
            domain_name: config.domain_name.clone(),
        })
    }

    /// Client config presenting the agent certificate and trusting only the CA.
    ///
    /// Without a configured domain name, the host of the control-plane URL is
    /// what the certificate is checked against.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        let config = ClientTlsConfig::new()
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone());
        match &self.domain_name {
            Some(domain) => config.domain_name(domain.clone()),
            None => config,
        }
    }
}

fn existing<'a>(
    path: &'a Option<PathBuf>,
    missing: TlsError,
    not_found: fn(PathBuf) -> TlsError,
) -> Result<&'a Path, TlsError> {
    let path = path.as_deref().ok_or(missing)?;
    if !path.exists() {
        return Err(not_found(path.to_path_buf()));
    }
    Ok(path)
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("domain_name", &self.domain_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_is_complete() {
        let mut config = TlsConfig::default();
        assert!(!config.is_complete());

        config.enabled = true;
        assert!(!config.is_complete());

        config.ca_cert_path = Some(PathBuf::from("/tmp/ca.crt"));
        config.cert_path = Some(PathBuf::from("/tmp/agent.crt"));
        assert!(!config.is_complete());

        config.key_path = Some(PathBuf::from("/tmp/agent.key"));
        assert!(config.is_complete());
    }

    #[tokio::test]
    async fn test_load_missing_paths() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::MissingCaCert)));
    }

    #[tokio::test]
    async fn test_load_nonexistent_files() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/agent.crt")),
            key_path: Some(PathBuf::from("/nonexistent/agent.key")),
            ..Default::default()
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }

    #[tokio::test]
    async fn test_load_reads_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.crt");
        let cert = dir.path().join("agent.crt");
        let key = dir.path().join("agent.key");
        for path in [&ca, &cert, &key] {
            std::fs::write(path, "-----BEGIN CERTIFICATE-----\n").unwrap();
        }

        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(ca),
            cert_path: Some(cert),
            key_path: Some(key),
            domain_name: Some("control.example.com".into()),
            ..Default::default()
        };
        let identity = TlsIdentity::load(&config).await.unwrap();
        assert!(format!("{:?}", identity).contains("control.example.com"));
    }
}
