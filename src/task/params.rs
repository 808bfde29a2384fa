use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::secrets::SECRET_MASK;

/// Type tag of the built-in shell runner.
pub const SHELL_SCRIPT: &str = "SHELL_SCRIPT";

/// Parameter types expose the string fields that may carry secret placeholders.
///
/// Substitution only ever touches the fields listed here.
pub trait Substitutable {
    fn substitutable_fields(&mut self) -> Vec<&mut String>;
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellParameters {
    pub script: String,
    pub working_directory: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub service_variables: BTreeMap<String, String>,
    /// Display form of `service_variables`; secret values appear as the mask
    pub safe_display_service_variables: BTreeMap<String, String>,
}

impl ShellParameters {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    /// Environment handed to the process: explicit environment, then service variables.
    pub fn process_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.environment.clone();
        env.extend(
            self.service_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    /// Plain values whose display counterpart is masked.
    pub fn masked_variable_values(&self) -> Vec<String> {
        self.service_variables
            .iter()
            .filter(|(name, _)| {
                self.safe_display_service_variables
                    .get(*name)
                    .is_some_and(|shown| shown == SECRET_MASK)
            })
            .map(|(_, value)| value.clone())
            .collect()
    }
}

impl Substitutable for ShellParameters {
    fn substitutable_fields(&mut self) -> Vec<&mut String> {
        let mut fields = vec![&mut self.script];
        if let Some(dir) = self.working_directory.as_mut() {
            fields.push(dir);
        }
        fields.extend(self.environment.values_mut());
        fields.extend(self.service_variables.values_mut());
        fields
    }
}

/// Decoded parameter object of a task.
#[derive(Clone, PartialEq)]
pub enum TaskParameters {
    Shell(ShellParameters),
    /// Payload of a type this crate does not model; every string leaf is substitutable
    Opaque(Value),
}

impl TaskParameters {
    pub fn decode(task_type: &str, payload: &[u8]) -> Result<Self> {
        if task_type == SHELL_SCRIPT {
            return Ok(TaskParameters::Shell(serde_json::from_slice(payload)?));
        }
        if payload.is_empty() {
            return Ok(TaskParameters::Opaque(Value::Null));
        }
        Ok(TaskParameters::Opaque(serde_json::from_slice(payload)?))
    }

    pub fn as_shell(&self) -> Option<&ShellParameters> {
        match self {
            TaskParameters::Shell(params) => Some(params),
            TaskParameters::Opaque(_) => None,
        }
    }

    pub fn masked_variable_values(&self) -> Vec<String> {
        match self {
            TaskParameters::Shell(params) => params.masked_variable_values(),
            TaskParameters::Opaque(_) => Vec::new(),
        }
    }
}

impl Substitutable for TaskParameters {
    fn substitutable_fields(&mut self) -> Vec<&mut String> {
        match self {
            TaskParameters::Shell(params) => params.substitutable_fields(),
            TaskParameters::Opaque(value) => {
                let mut fields = Vec::new();
                collect_strings(value, &mut fields);
                fields
            }
        }
    }
}

fn collect_strings<'a>(value: &'a mut Value, out: &mut Vec<&'a mut String>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => {
            for item in items.iter_mut() {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

// Values may hold resolved secrets, so only the shape is printed.
impl fmt::Debug for TaskParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskParameters::Shell(params) => f
                .debug_struct("Shell")
                .field("environment", &params.environment.keys().collect::<Vec<_>>())
                .field(
                    "service_variables",
                    &params.service_variables.keys().collect::<Vec<_>>(),
                )
                .finish_non_exhaustive(),
            TaskParameters::Opaque(_) => f.debug_struct("Opaque").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_shell_parameters() {
        let params = TaskParameters::decode(
            SHELL_SCRIPT,
            br#"{"script":"echo hi","environment":{"A":"1"},"workingDirectory":"/tmp"}"#,
        )
        .unwrap();
        let shell = params.as_shell().unwrap();
        assert_eq!(shell.script, "echo hi");
        assert_eq!(shell.environment["A"], "1");
        assert_eq!(shell.working_directory.as_deref(), Some("/tmp"));
    }

    #[test]
    fn test_decode_opaque_and_empty() {
        let params = TaskParameters::decode("HTTP", br#"{"url":"x"}"#).unwrap();
        assert!(params.as_shell().is_none());
        assert_eq!(
            TaskParameters::decode("HTTP", b"").unwrap(),
            TaskParameters::Opaque(Value::Null)
        );
        assert!(TaskParameters::decode(SHELL_SCRIPT, b"not json").is_err());
    }

    #[test]
    fn test_shell_substitutable_fields_skip_display_values() {
        let mut shell = ShellParameters::new("run");
        shell.working_directory = Some("/w".into());
        shell.environment.insert("E".into(), "e".into());
        shell.service_variables.insert("S".into(), "s".into());
        shell
            .safe_display_service_variables
            .insert("S".into(), SECRET_MASK.into());

        let fields: Vec<String> = shell
            .substitutable_fields()
            .into_iter()
            .map(|f| f.clone())
            .collect();
        assert_eq!(fields, vec!["run", "/w", "e", "s"]);
    }

    #[test]
    fn test_opaque_substitutable_fields_walk_nested_strings() {
        let mut params = TaskParameters::Opaque(serde_json::json!({
            "a": "one",
            "b": [1, "two", {"c": "three"}],
            "d": true
        }));
        let mut fields: Vec<String> = params
            .substitutable_fields()
            .into_iter()
            .map(|f| f.clone())
            .collect();
        fields.sort();
        assert_eq!(fields, vec!["one", "three", "two"]);
    }

    #[test]
    fn test_masked_variable_values() {
        let mut shell = ShellParameters::new("run");
        shell.service_variables.insert("TOKEN".into(), "abc".into());
        shell.service_variables.insert("REGION".into(), "eu".into());
        shell
            .safe_display_service_variables
            .insert("TOKEN".into(), SECRET_MASK.into());
        shell
            .safe_display_service_variables
            .insert("REGION".into(), "eu".into());
        assert_eq!(shell.masked_variable_values(), vec!["abc".to_string()]);
    }

    #[test]
    fn test_debug_hides_values() {
        let mut shell = ShellParameters::new("echo s3cr3t");
        shell.environment.insert("PASS".into(), "s3cr3t".into());
        let rendered = format!("{:?}", TaskParameters::Shell(shell));
        assert!(rendered.contains("PASS"));
        assert!(!rendered.contains("s3cr3t"));
    }
}
