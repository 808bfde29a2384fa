use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{AgentError, Result};
use crate::task::{EncryptedRecord, EncryptionConfig};

/// Encryption-config kind handled by [`KeyringDecryptor`].
pub const KEYRING_KIND: &str = "keyring";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Batch decryption of secret records owned by one encryption config.
#[tonic::async_trait]
pub trait SecretDecryptor: Send + Sync {
    /// Returns plaintext by record id for every record in `records`.
    async fn decrypt_batch(
        &self,
        config: &EncryptionConfig,
        records: &[EncryptedRecord],
    ) -> Result<HashMap<String, SecretString>>;
}

/// AES-256-GCM decryption with keys held in local configuration.
///
/// A record's value is `nonce (12 bytes) || ciphertext || tag`.
pub struct KeyringDecryptor {
    keys: HashMap<String, SecretString>,
}

impl KeyringDecryptor {
    /// `keys` maps encryption-config id to a base64-encoded 32-byte key.
    pub fn new(keys: HashMap<String, SecretString>) -> Self {
        Self { keys }
    }

    fn cipher(&self, config: &EncryptionConfig) -> Result<Aes256Gcm> {
        let encoded = self.keys.get(&config.id).ok_or_else(|| {
            AgentError::SecretDecryption(format!("no key configured for {}", config.id))
        })?;
        let key = STANDARD.decode(encoded.expose_secret()).map_err(|_| {
            AgentError::SecretDecryption(format!("key for {} is not valid base64", config.id))
        })?;
        Aes256Gcm::new_from_slice(&key).map_err(|_| {
            AgentError::SecretDecryption(format!("key for {} must be 32 bytes", config.id))
        })
    }

    fn open(cipher: &Aes256Gcm, record: &EncryptedRecord) -> Result<SecretString> {
        if record.encrypted_value.len() < NONCE_LEN + TAG_LEN {
            return Err(AgentError::SecretDecryption(format!(
                "record {} is truncated",
                record.id
            )));
        }
        let (nonce, ciphertext) = record.encrypted_value.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                AgentError::SecretDecryption(format!("record {} failed authentication", record.id))
            })?;
        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| AgentError::SecretDecryption(format!("record {} is not UTF-8", record.id)))
    }
}

#[tonic::async_trait]
impl SecretDecryptor for KeyringDecryptor {
    async fn decrypt_batch(
        &self,
        config: &EncryptionConfig,
        records: &[EncryptedRecord],
    ) -> Result<HashMap<String, SecretString>> {
        if config.kind != KEYRING_KIND {
            return Err(AgentError::SecretDecryption(format!(
                "unsupported encryption config kind '{}' for {}",
                config.kind, config.id
            )));
        }
        let cipher = self.cipher(config)?;
        records
            .iter()
            .map(|record| Ok((record.id.clone(), Self::open(&cipher, record)?)))
            .collect()
    }
}
