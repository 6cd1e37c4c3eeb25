//! Deterministic fingerprints for queue deduplication
//!
//! A fingerprint is the lowercase hex SHA-256 of the compact JSON rendering
//! of a value. Object keys are emitted in lexicographic order (serde_json's
//! default map), so two values with the same content always hash the same
//! regardless of how they were built.

use crate::error::{LakeError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hash raw bytes
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash the compact JSON form of a value
pub fn fingerprint_json(value: &Value) -> Result<String> {
    let encoded = serde_json::to_vec(value)?;
    Ok(fingerprint_bytes(&encoded))
}

/// Hash only the listed top-level fields of a serializable object.
///
/// Fields missing from the object are hashed as `null`, so adding an
/// optional field to a type later does not change existing identities as
/// long as the field list stays the same.
pub fn fingerprint_fields<T: Serialize>(value: &T, fields: &[&str]) -> Result<String> {
    let Value::Object(full) = serde_json::to_value(value)? else {
        return Err(LakeError::Fingerprint(
            "only JSON objects can be fingerprinted by field".to_string(),
        ));
    };

    let mut selected = Map::new();
    for field in fields {
        let value = full.get(*field).cloned().unwrap_or(Value::Null);
        selected.insert((*field).to_string(), value);
    }

    fingerprint_json(&Value::Object(selected))
}
