//! FhirLake Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental extraction of FHIR resources into bounded processing jobs.
//!
//! - [`splitter`]: partitions a resource type's time window into sub-jobs of
//!   bounded record count by binary search against a count oracle, and
//!   merges undersized ones in a candidate pool
//! - [`orchestrator`]: dispatches those jobs to a queue under a concurrency
//!   cap, tracks them to completion, and checkpoints progress so a run can
//!   always be resumed
//! - [`versioning`]: per job version identity fields and tracking strategy
//! - [`fhir`] and [`storage`]: FHIR search and Postgres implementations of
//!   the collaborator traits in [`framework`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fhirlake_ingest::config::SplitConfig;
//! use fhirlake_ingest::fhir::FhirSearchOracle;
//! use fhirlake_ingest::config::FhirServerConfig;
//! use fhirlake_ingest::splitter::JobSplitter;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let oracle = Arc::new(FhirSearchOracle::new(&FhirServerConfig::default())?);
//!     let splitter = JobSplitter::new(oracle, SplitConfig::new(10_000, 100_000))?;
//!     let end = chrono::Utc::now();
//!     let mut cursor = splitter.split("Observation", None, end, CancellationToken::new())?;
//!     while let Some(sub_job) = cursor.next_sub_job().await? {
//!         tracing::info!(range = %sub_job.range, count = sub_job.resource_count, "sub-job");
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod fhir;
pub mod framework;
pub mod jobs;
pub mod orchestrator;
pub mod splitter;
pub mod storage;
pub mod versioning;

pub use error::{FailureKind, IngestError, Result};
