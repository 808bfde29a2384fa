use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};

/// Replacement for every masked value.
pub const SECRET_MASK: &str = "**************";

/// Masks one task's secret values in log lines and outputs.
pub struct LogSanitizer {
    task_id: String,
    matcher: Option<AhoCorasick>,
    patterns: usize,
}

impl LogSanitizer {
    pub fn new(task_id: impl Into<String>, secrets: &[SecretString]) -> Self {
        let task_id = task_id.into();
        let mut patterns: Vec<&str> = secrets
            .iter()
            .map(|s| s.expose_secret())
            .filter(|s| !s.is_empty())
            .collect();
        patterns.sort_unstable();
        patterns.dedup();

        let matcher = if patterns.is_empty() {
            None
        } else {
            match AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&patterns)
            {
                Ok(matcher) => Some(matcher),
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to build secret matcher");
                    None
                }
            }
        };

        Self {
            task_id,
            patterns: patterns.len(),
            matcher,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
    }

    pub fn sanitize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match &self.matcher {
            Some(matcher) if matcher.is_match(text) => {
                let masks = vec![SECRET_MASK; matcher.patterns_len()];
                Cow::Owned(matcher.replace_all(text, &masks))
            }
            _ => Cow::Borrowed(text),
        }
    }
}

impl fmt::Debug for LogSanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSanitizer")
            .field("task_id", &self.task_id)
            .field("patterns", &self.patterns)
            .finish()
    }
}

/// Sanitizers of all currently executing tasks.
///
/// Every task log line passes through all of them, so one task's output can
/// never leak another running task's secrets.
#[derive(Debug, Default)]
pub struct SanitizerRegistry {
    sanitizers: DashMap<String, Arc<LogSanitizer>>,
}

impl SanitizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sanitizer: Arc<LogSanitizer>) {
        if sanitizer.is_empty() {
            return;
        }
        self.sanitizers
            .insert(sanitizer.task_id().to_string(), sanitizer);
    }

    pub fn unregister(&self, task_id: &str) {
        self.sanitizers.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.sanitizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sanitizers.is_empty()
    }

    pub fn sanitize(&self, text: &str) -> String {
        let active: Vec<Arc<LogSanitizer>> =
            self.sanitizers.iter().map(|e| Arc::clone(e.value())).collect();
        active
            .iter()
            .fold(text.to_string(), |acc, s| s.sanitize(&acc).into_owned())
    }
}
