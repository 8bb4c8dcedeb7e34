//! Secret redaction for audit rows.
//!
//! Applied to tool arguments before they reach the store, so a credential
//! can never be recovered from the audit log.  Key matching is exact on the
//! lowercased key name; values are replaced with a fixed sentinel, and the
//! walk recurses through nested objects and arrays.

use serde_json::Value;

/// Replacement written in place of a secret value.
pub const REDACTED: &str = "***REDACTED***";

/// Keys whose values are always redacted, compared case-insensitively.
const SENSITIVE_KEYS: &[&str] = &["_client_token", "password", "token", "api_token", "secret"];

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str())
}

/// Return a copy of `value` with every sensitive value replaced.
pub fn redact_args(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    if is_sensitive(key) {
                        (key.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), redact_args(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_args).collect()),
        other => other.clone(),
    }
}
