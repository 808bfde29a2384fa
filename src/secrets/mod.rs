//! Just-in-time secret resolution for task parameters.
//!
//! Secrets travel encrypted inside the task package. Right before execution the
//! [`SecretInjector`] decrypts them in one batch per encryption config,
//! substitutes placeholders in the parameter object and derives the masking set
//! the task's [`LogSanitizer`] uses. Plaintext lives only inside the returned
//! [`ResolvedTask`] and is dropped with it.

pub mod functor;
pub mod keyring;
pub mod sanitizer;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{AgentError, Result};
use crate::task::{EncryptedRecord, SecretBundle, TaskPackage};

pub use functor::SecretFunctor;
pub use keyring::{KeyringDecryptor, SecretDecryptor, KEYRING_KIND};
pub use sanitizer::{LogSanitizer, SanitizerRegistry, SECRET_MASK};

/// Values to be masked in one task's logs and outputs.
#[derive(Default)]
pub struct MaskingSet {
    values: Vec<SecretString>,
}

impl MaskingSet {
    pub fn new(values: Vec<SecretString>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn sanitizer(&self, task_id: &str) -> LogSanitizer {
        LogSanitizer::new(task_id, &self.values)
    }
}

impl fmt::Debug for MaskingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskingSet")
            .field("len", &self.values.len())
            .finish()
    }
}

/// A package whose parameters hold resolved secrets, ready to execute.
pub struct ResolvedTask {
    pub package: TaskPackage,
    pub masking: MaskingSet,
}

impl ResolvedTask {
    /// Wrap a package that carries no secrets.
    pub fn plain(package: TaskPackage) -> Self {
        Self {
            package,
            masking: MaskingSet::default(),
        }
    }

    pub fn task_id(&self) -> &str {
        self.package.task_id()
    }
}

impl fmt::Debug for ResolvedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTask")
            .field("task_id", &self.package.task.id)
            .field("task_type", &self.package.task.task_type)
            .field("masking", &self.masking)
            .finish_non_exhaustive()
    }
}

pub struct SecretInjector {
    decryptor: Arc<dyn SecretDecryptor>,
}

impl SecretInjector {
    pub fn new(decryptor: Arc<dyn SecretDecryptor>) -> Self {
        Self { decryptor }
    }

    pub async fn inject(&self, mut package: TaskPackage) -> Result<ResolvedTask> {
        let values = self.decrypt_all(&package.secrets).await?;
        let decrypted = values.len();

        let mut masked: Vec<SecretString> = values
            .values()
            .map(|v| SecretString::from(v.expose_secret().to_string()))
            .collect();

        let functor = SecretFunctor::new(package.secrets.functor_token, values);
        let substituted = functor.apply(&mut package.task.parameters)?;

        masked.extend(
            package
                .task
                .parameters
                .masked_variable_values()
                .into_iter()
                .map(SecretString::from),
        );
        masked.append(&mut package.secrets.mask_values);

        tracing::debug!(
            task_id = %package.task.id,
            decrypted,
            substituted,
            masked = masked.len(),
            "Resolved task secrets"
        );

        Ok(ResolvedTask {
            package,
            masking: MaskingSet::new(masked),
        })
    }

    /// Secret id to plaintext, one decryption call per encryption config.
    async fn decrypt_all(&self, bundle: &SecretBundle) -> Result<HashMap<String, SecretString>> {
        let mut values = HashMap::new();
        if bundle.details.is_empty() {
            return Ok(values);
        }

        let mut groups: BTreeMap<&str, Vec<(&str, &EncryptedRecord)>> = BTreeMap::new();
        for (secret_id, reference) in &bundle.details {
            groups
                .entry(reference.config_id.as_str())
                .or_default()
                .push((secret_id.as_str(), &reference.record));
        }

        for (config_id, references) in groups {
            let config = bundle.configs.get(config_id).ok_or_else(|| {
                AgentError::SecretDecryption(format!(
                    "encryption config {} missing from package",
                    config_id
                ))
            })?;
            let mut records: Vec<EncryptedRecord> =
                references.iter().map(|(_, r)| (*r).clone()).collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            records.dedup_by(|a, b| a.id == b.id);

            let plaintext = self.decryptor.decrypt_batch(config, &records).await?;
            for (secret_id, record) in references {
                let value = plaintext.get(&record.id).ok_or_else(|| {
                    AgentError::SecretDecryption(format!(
                        "record {} was not returned by {}",
                        record.id, config_id
                    ))
                })?;
                values.insert(
                    secret_id.to_string(),
                    SecretString::from(value.expose_secret().to_string()),
                );
            }
        }
        Ok(values)
    }
}
