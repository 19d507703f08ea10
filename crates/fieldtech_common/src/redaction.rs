//! Redaction - scrub secrets and personal data before they reach disk
//!
//! Changelog entries pass tool input through a [`Redactor`] before writing.
//! What happens when redaction itself fails is a policy decision of the
//! caller (see [`redact_for_storage`]):
//! - fail-closed: a placeholder is stored instead of the raw text
//! - fail-open: the raw text is stored and a warning is logged

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

/// Stored instead of the input when fail-closed redaction fails
pub const REDACTION_FAILED_PLACEHOLDER: &str = "[REDACTED:REDACTION_FAILED]";

/// Stored in place of any value whose key names a secret
pub const SECRET_KEY_PLACEHOLDER: &str = "[REDACTED:SECRET_KEY]";

/// Default cap on text a [`PatternRedactor`] will scan
pub const DEFAULT_MAX_INPUT_BYTES: usize = 256 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedactionError {
    #[error("input too large to redact: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("invalid redaction pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("redaction failed: {0}")]
    Failed(String),
}

/// Anonymizes free text
pub trait Redactor: Send + Sync {
    fn anonymize(&self, text: &str) -> Result<String, RedactionError>;
}

/// Passes text through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRedactor;

impl Redactor for NoopRedactor {
    fn anonymize(&self, text: &str) -> Result<String, RedactionError> {
        Ok(text.to_string())
    }
}

static SECRET_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(password|passwd|passphrase|pwd|kennwort|secret|token",
        r"|api[_-]?key|credential|private[_-]?key)"
    ))
    .expect("static regex")
});

/// True when a JSON key or parameter name suggests its value is a secret
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEY.is_match(key)
}

struct Pattern {
    regex: Regex,
    placeholder: &'static str,
    /// Keep capture group 1 (the key) and replace the rest
    keep_key: bool,
}

static BUILTIN_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    let patterns: Vec<(&str, &'static str, bool)> = vec![
        // JWT first, before the generic token rules see it
        (r"eyJ[a-zA-Z0-9_-]*\.eyJ[a-zA-Z0-9_-]*\.[a-zA-Z0-9_-]+", "[REDACTED:JWT]", false),
        (
            r"-----BEGIN[A-Z ]*PRIVATE KEY-----[\s\S]*?-----END[A-Z ]*PRIVATE KEY-----",
            "[REDACTED:PRIVATE_KEY]",
            false,
        ),
        (r#"(?i)--password[=\s]+['"]?[^'"\s]+['"]?"#, "--password [REDACTED:PASSWORD]", false),
        (
            r#"(?i)(password|passwd|pwd|kennwort)\s*[=:]\s*['"]?[^'"\s]+['"]?"#,
            "[REDACTED:PASSWORD]",
            true,
        ),
        (r#"(?i)(api[_-]?key|apikey)\s*[=:]\s*['"]?[^'"\s]+['"]?"#, "[REDACTED:API_KEY]", true),
        (r"(?i)bearer\s+[a-zA-Z0-9_\-\.]+", "Bearer [REDACTED:BEARER_TOKEN]", false),
        (r"AKIA[0-9A-Z]{16}", "[REDACTED:AWS_CREDENTIAL]", false),
        (
            r"(?i)(postgres|mysql|mongodb|redis)://[^:\s]+:[^@\s]+@\S+",
            "[REDACTED:DATABASE_URL]",
            false,
        ),
        (
            r#"(?i)(secret|token|credential)\s*[=:]\s*['"]?[^'"\s]{8,}['"]?"#,
            "[REDACTED:SECRET]",
            true,
        ),
        (r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", "[REDACTED:EMAIL]", false),
    ];

    patterns
        .into_iter()
        .filter_map(|(p, placeholder, keep_key)| {
            Regex::new(p).ok().map(|regex| Pattern {
                regex,
                placeholder,
                keep_key,
            })
        })
        .collect()
});

/// Regex-based redactor for passwords, tokens, keys and e-mail addresses
pub struct PatternRedactor {
    extra: Vec<Regex>,
    max_input_bytes: usize,
}

impl Default for PatternRedactor {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternRedactor {
    pub fn new() -> Self {
        Self {
            extra: Vec::new(),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }

    /// Add a site-specific pattern, replaced by `[REDACTED]`
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, RedactionError> {
        let regex = Regex::new(pattern).map_err(|e| RedactionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.extra.push(regex);
        Ok(self)
    }

    pub fn with_max_input_bytes(mut self, max: usize) -> Self {
        self.max_input_bytes = max;
        self
    }
}

impl Redactor for PatternRedactor {
    fn anonymize(&self, text: &str) -> Result<String, RedactionError> {
        if text.len() > self.max_input_bytes {
            return Err(RedactionError::TooLarge {
                size: text.len(),
                max: self.max_input_bytes,
            });
        }

        let mut result = text.to_string();
        for pattern in BUILTIN_PATTERNS.iter() {
            let replaced = if pattern.keep_key {
                pattern
                    .regex
                    .replace_all(&result, |caps: &regex::Captures| {
                        format!("{}={}", &caps[1], pattern.placeholder)
                    })
                    .into_owned()
            } else {
                pattern
                    .regex
                    .replace_all(&result, pattern.placeholder)
                    .into_owned()
            };
            result = replaced;
        }

        for regex in &self.extra {
            result = regex.replace_all(&result, "[REDACTED]").into_owned();
        }

        Ok(result)
    }
}

/// Redact text that is about to be persisted, applying the failure policy
pub fn redact_for_storage(redactor: &dyn Redactor, text: &str, fail_closed: bool) -> String {
    match redactor.anonymize(text) {
        Ok(redacted) => redacted,
        Err(e) if fail_closed => {
            warn!("Redaction failed, storing placeholder: {}", e);
            REDACTION_FAILED_PLACEHOLDER.to_string()
        }
        Err(e) => {
            warn!("Redaction failed, storing raw text: {}", e);
            text.to_string()
        }
    }
}

/// Redact a JSON value that is about to be persisted.
///
/// Values under secret-looking keys are replaced outright. Every other
/// string leaf goes through `redactor` with the failure policy applied per
/// leaf, so one failing string never hides the rest of the structure.
pub fn redact_json_for_storage(
    redactor: &dyn Redactor,
    value: &Value,
    fail_closed: bool,
) -> Value {
    match value {
        Value::String(s) => Value::String(redact_for_storage(redactor, s, fail_closed)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let redacted = if is_secret_key(k) {
                        Value::String(SECRET_KEY_PLACEHOLDER.to_string())
                    } else {
                        redact_json_for_storage(redactor, v, fail_closed)
                    };
                    (k.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| redact_json_for_storage(redactor, v, fail_closed))
                .collect(),
        ),
        other => other.clone(),
    }
}
