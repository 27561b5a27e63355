//! Payload sanitization before logging or persistence
//!
//! Redacts credential-shaped substrings and common PII, escapes control
//! characters in free text, and mints unpredictable error identifiers.

use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde_json::{Map, Value};

/// A compiled redaction rule
struct Rule {
    name: &'static str,
    regex: &'static Lazy<Regex>,
    replacement: &'static str,
}

macro_rules! pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: Lazy<Regex> =
            Lazy::new(|| Regex::new($regex_str).expect("Valid redaction regex"));
    };
}

// Credentials
pattern!(
    RE_PASSWORD_ASSIGN,
    r#"(?i)\b(password|passwd|pwd)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#
);
pattern!(
    RE_API_KEY_ASSIGN,
    r#"(?i)\b(api[_-]?key|apikey|secret|access[_-]?token|auth[_-]?token|token)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#
);
pattern!(RE_BEARER, r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]{8,}");
pattern!(
    RE_CONNECTION_SECRET,
    r"(?i)\b([a-z][a-z0-9+.-]*://[^:/?#\s@]+:)([^@\s/]+)(@)"
);
pattern!(RE_PROVIDER_KEY, r"\b(?:sk|pk|rk)[-_][A-Za-z0-9_-]{16,}\b");
pattern!(RE_AWS_ACCESS_KEY, r"\bAKIA[0-9A-Z]{16}\b");

// PII
pattern!(RE_EMAIL, r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}");
pattern!(RE_SSN, r"\b\d{3}-\d{2}-\d{4}\b");
pattern!(RE_CARD, r"\b(?:\d[ -]?){12,18}\d\b");

static RULES: [Rule; 9] = [
    Rule {
        name: "connection_secret",
        regex: &RE_CONNECTION_SECRET,
        replacement: "${1}[REDACTED]${3}",
    },
    Rule {
        name: "password",
        regex: &RE_PASSWORD_ASSIGN,
        replacement: "${1}${2}[REDACTED]",
    },
    Rule {
        name: "api_key",
        regex: &RE_API_KEY_ASSIGN,
        replacement: "${1}${2}[REDACTED]",
    },
    Rule {
        name: "bearer",
        regex: &RE_BEARER,
        replacement: "Bearer [REDACTED]",
    },
    Rule {
        name: "provider_key",
        regex: &RE_PROVIDER_KEY,
        replacement: "[REDACTED_KEY]",
    },
    Rule {
        name: "aws_access_key",
        regex: &RE_AWS_ACCESS_KEY,
        replacement: "[REDACTED_KEY]",
    },
    Rule {
        name: "email",
        regex: &RE_EMAIL,
        replacement: "[EMAIL]",
    },
    Rule {
        name: "ssn",
        regex: &RE_SSN,
        replacement: "[SSN]",
    },
    Rule {
        name: "card",
        regex: &RE_CARD,
        replacement: "[CARD]",
    },
];

/// Object keys whose values are always redacted wholesale
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "api_key",
    "apikey",
    "api-key",
    "token",
    "access_token",
    "auth_token",
    "authorization",
    "private_key",
    "connection_string",
];

/// Stateless sanitizer; cheap to clone and share
#[derive(Debug, Clone, Copy, Default)]
pub struct SecuritySanitizer;

impl SecuritySanitizer {
    pub fn new() -> Self {
        Self
    }

    /// Redact secrets and PII from free text, then escape control characters
    pub fn sanitize_text(&self, text: &str) -> String {
        let redacted = self.redact(text);
        self.escape_control(&redacted)
    }

    /// Redaction only, no escaping
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in RULES.iter() {
            if rule.regex.is_match(&out) {
                tracing::trace!(rule = rule.name, "Redacting match");
                out = rule.regex.replace_all(&out, rule.replacement).into_owned();
            }
        }
        out
    }

    /// Escape `\n`, `\r`, NUL and other control characters so a value cannot
    /// forge extra log lines
    pub fn escape_control(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                '\0' => out.push_str("\\0"),
                c if c.is_control() => out.push_str(&format!("\\u{{{:04x}}}", c as u32)),
                c => out.push(c),
            }
        }
        out
    }

    /// Sanitize every string in a structured payload; values under
    /// sensitive keys are replaced entirely
    pub fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize_value(v)).collect()),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, v) in map {
                    let clean_key = self.escape_control(key);
                    if is_sensitive_key(key) {
                        out.insert(clean_key, Value::String("[REDACTED]".to_string()));
                    } else {
                        out.insert(clean_key, self.sanitize_value(v));
                    }
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Externally visible error identifier from the OS random source
    pub fn error_id(&self) -> String {
        let mut bytes = [0u8; 12];
        OsRng.fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        format!("ERR-{}", hex)
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lower == *k)
}
