// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload redaction.
//!
//! A value is masked with [`MASK`] when its map key contains (case
//! insensitively) any sensitive key, whatever the value's type. String
//! values under other keys are masked when they look like credentials:
//! bearer tokens, long base64 runs, or JWTs.
//!
//! ```
//! use scope_recorder::Redactor;
//! use serde_json::json;
//!
//! let redactor = Redactor::default();
//! let out = redactor.redact(&json!({"user": {"password": "abc123", "name": "ann"}}));
//! assert_eq!(out, json!({"user": {"password": "[FILTERED]", "name": "ann"}}));
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

pub const MASK: &str = "[FILTERED]";

pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "password_confirmation",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_token",
    "refresh_token",
    "authorization",
    "auth",
    "credential",
    "private_key",
    "secret_key",
    "credit_card",
    "card_number",
    "cvv",
    "ssn",
];

/// Shorter strings are never treated as secrets.
const MIN_SECRET_LEN: usize = 20;

fn base64_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/=]{40,}$").ok()).as_ref()
}

fn jwt_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^ey[A-Za-z0-9_-]+\.ey[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+$").ok())
        .as_ref()
}

/// Structural check for credential-shaped strings.
pub fn looks_like_secret(value: &str) -> bool {
    if value.len() < MIN_SECRET_LEN {
        return false;
    }
    value.starts_with("Bearer ")
        || base64_pattern().is_some_and(|re| re.is_match(value))
        || jwt_pattern().is_some_and(|re| re.is_match(value))
}

#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl Redactor {
    /// Defaults plus `extra` key substrings.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys: Vec<String> = DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect();
        for key in extra {
            let key = key.as_ref().trim().to_lowercase();
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        Self { keys }
    }

    pub fn sensitive_keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.keys.iter().any(|k| key.contains(k.as_str()))
    }

    /// Deep copy of `value` with sensitive data masked.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            Value::String(s) if looks_like_secret(s) => Value::String(MASK.to_string()),
            other => other.clone(),
        }
    }

    pub fn redact_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let value = if self.is_sensitive_key(key) {
                    Value::String(MASK.to_string())
                } else {
                    self.redact(value)
                };
                (key.clone(), value)
            })
            .collect()
    }
}
