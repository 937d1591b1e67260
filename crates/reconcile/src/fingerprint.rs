//! Content fingerprints for resource configurations
//!
//! A fingerprint is the hex SHA-256 of the compact, key-sorted JSON form of
//! a cleaned configuration. Cleaning drops server-managed fields, trims
//! strings, drops nulls and anything that becomes empty, and stabilizes
//! array order with [`crate::canonical::stabilize`].

use crate::canonical::{canonical_text, stabilize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Fields that never take part in a fingerprint.
pub const EXCLUDED_FIELDS: [&str; 10] = [
    "id",
    "created_at",
    "updated_at",
    "last_execution",
    "next_execution",
    "execution_count",
    "error_count",
    "last_error",
    "request_id",
    "metadata",
];

/// Fingerprint a configuration value.
pub fn fingerprint(config: &Value) -> String {
    let cleaned = clean(config).unwrap_or(Value::Null);
    sha256_hex(canonical_text(&cleaned).as_bytes())
}

/// Hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprints are compared as plain strings.
pub fn fingerprints_equal(a: &str, b: &str) -> bool {
    a == b
}

/// Whether `s` looks like a fingerprint: 64 lowercase hex characters.
pub fn is_valid_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Clean a value for hashing. Returns `None` when nothing is left.
fn clean(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(Value::String(s.trim().to_string())),
        Value::Array(items) => {
            let mut cleaned: Vec<Value> = items.iter().filter_map(clean).collect();
            if cleaned.is_empty() {
                return None;
            }
            stabilize(&mut cleaned);
            Some(Value::Array(cleaned))
        }
        Value::Object(obj) => {
            let cleaned: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| !EXCLUDED_FIELDS.contains(&k.as_str()))
                .filter_map(|(k, v)| clean(v).map(|v| (k.clone(), v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other.clone()),
    }
}
