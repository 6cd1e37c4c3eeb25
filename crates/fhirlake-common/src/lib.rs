//! FhirLake Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the FhirLake workspace.
//!
//! - **Error Handling**: [`LakeError`] and the crate [`Result`] alias
//! - **Fingerprints**: deterministic SHA-256 identities over canonical JSON
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Time**: FHIR instant formatting and millisecond arithmetic
//!
//! # Example
//!
//! ```no_run
//! use fhirlake_common::fingerprint::fingerprint_json;
//!
//! fn identity() -> fhirlake_common::Result<String> {
//!     fingerprint_json(&serde_json::json!({"jobType": "processing", "sequenceId": 3}))
//! }
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod time;

pub use error::{LakeError, Result};
