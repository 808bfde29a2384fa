use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{AgentError, Result};
use crate::task::Substitutable;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r#"\$\{secretManager\.obtain\("([^"]+)",\s*(-?\d+)\)\}"#)
            .expect("placeholder pattern is valid")
    })
}

/// Resolves `${secretManager.obtain("<id>", <token>)}` placeholders for one task.
///
/// Placeholders minted for another task carry a different token and are left as is.
pub struct SecretFunctor {
    token: i64,
    values: HashMap<String, SecretString>,
}

impl SecretFunctor {
    pub fn new(token: i64, values: HashMap<String, SecretString>) -> Self {
        Self { token, values }
    }

    /// Returns `None` when `input` contains nothing to resolve.
    pub fn resolve(&self, input: &str) -> Result<Option<String>> {
        let re = placeholder();
        if !re.is_match(input) {
            return Ok(None);
        }

        let mut missing = None;
        let resolved = re.replace_all(input, |caps: &Captures<'_>| {
            let secret_id = &caps[1];
            let token = caps[2].parse::<i64>().ok();
            if token != Some(self.token) {
                tracing::warn!(secret_id, "Ignoring secret placeholder minted for another task");
                return caps[0].to_string();
            }
            match self.values.get(secret_id) {
                Some(value) => value.expose_secret().to_string(),
                None => {
                    missing.get_or_insert_with(|| secret_id.to_string());
                    caps[0].to_string()
                }
            }
        });

        if let Some(secret_id) = missing {
            return Err(AgentError::SecretDecryption(format!(
                "secret {} was not supplied with the task",
                secret_id
            )));
        }
        Ok(Some(resolved.into_owned()))
    }

    /// Substitute every placeholder in `target`. Returns the number of fields changed.
    pub fn apply<T: Substitutable + ?Sized>(&self, target: &mut T) -> Result<usize> {
        let mut changed = 0;
        for field in target.substitutable_fields() {
            if let Some(resolved) = self.resolve(field.as_str())? {
                if resolved != *field {
                    *field = resolved;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ShellParameters;

    fn functor() -> SecretFunctor {
        let mut values = HashMap::new();
        values.insert("db-pass".to_string(), SecretString::from("hunter2"));
        values.insert("api".to_string(), SecretString::from("tok-1"));
        SecretFunctor::new(42, values)
    }

    #[test]
    fn test_resolve_replaces_matching_token() {
        let resolved = functor()
            .resolve(r#"PGPASSWORD=${secretManager.obtain("db-pass", 42)} psql"#)
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("PGPASSWORD=hunter2 psql"));
    }

    #[test]
    fn test_resolve_leaves_foreign_token() {
        let input = r#"${secretManager.obtain("db-pass", 7)}"#;
        assert_eq!(functor().resolve(input).unwrap().as_deref(), Some(input));
    }

    #[test]
    fn test_resolve_without_placeholder() {
        assert_eq!(functor().resolve("plain text").unwrap(), None);
    }

    #[test]
    fn test_unknown_secret_is_an_error() {
        let err = functor()
            .resolve(r#"${secretManager.obtain("missing", 42)}"#)
            .unwrap_err();
        assert!(matches!(err, AgentError::SecretDecryption(_)));
    }

    #[test]
    fn test_apply_counts_changed_fields() {
        let mut params = ShellParameters::new(r#"curl -H "${secretManager.obtain("api", 42)}""#);
        params.environment.insert(
            "PASS".into(),
            r#"${secretManager.obtain("db-pass", 42)}"#.into(),
        );
        params.environment.insert("PLAIN".into(), "value".into());

        assert_eq!(functor().apply(&mut params).unwrap(), 2);
        assert_eq!(params.script, r#"curl -H "tok-1""#);
        assert_eq!(params.environment["PASS"], "hunter2");
        assert_eq!(params.environment["PLAIN"], "value");
    }
}
