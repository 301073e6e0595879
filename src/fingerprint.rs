//! Deterministic fingerprints over JSON mappings.
//!
//! A mapping is rendered as canonical JSON (object keys sorted at every
//! level, strings quoted) and the first 16 bytes of its SHA-256 digest
//! become a [`Uuid`]. Two mappings holding the same pairs always produce
//! the same fingerprint regardless of how they were built, and values of
//! different JSON types never collide.

use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

/// Fingerprint a JSON object.
pub fn fingerprint(map: &Map<String, Value>) -> Uuid {
    let digest = Sha256::digest(canonical_object(map).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Fingerprint rendered as 32 lowercase hex digits (the job-key hash format).
pub fn key_hash(key: &Map<String, Value>) -> String {
    fingerprint(key).simple().to_string()
}

fn canonical_object(map: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let fields: Vec<String> = keys
        .into_iter()
        .map(|k| format!("{}:{}", Value::String(k.clone()), canonical(&map[k.as_str()])))
        .collect();
    format!("{{{}}}", fields.join(","))
}

fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => canonical_object(map),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
