//! Error types shared across FhirLake crates

use thiserror::Error;

/// Result type alias for shared FhirLake operations
pub type Result<T> = std::result::Result<T, LakeError>;

/// Shared error type
#[derive(Error, Debug)]
pub enum LakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Cannot fingerprint value: {0}")]
    Fingerprint(String),
}
