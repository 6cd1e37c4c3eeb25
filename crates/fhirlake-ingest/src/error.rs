//! Error types for the ingestion core
//!
//! Every failure the orchestrator surfaces maps onto one of three
//! [`FailureKind`]s, which is what callers use to decide between resuming a
//! run from its checkpoint and paging an operator.

use chrono::{DateTime, Utc};
use fhirlake_common::LakeError;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// How a caller should react to a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry the whole run; it resumes from the last persisted checkpoint
    Retriable,
    /// Needs operator attention
    NonRetriable,
    /// Cooperative cancellation, not a failure
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retriable => "retriable",
            FailureKind::NonRetriable => "non_retriable",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Resource count backend unhealthy for {resource_type} at {at}: {detail}")]
    BackendUnhealthy {
        resource_type: String,
        at: DateTime<Utc>,
        detail: String,
    },

    #[error("Count oracle error: {0}")]
    Oracle(String),

    #[error("Processing job {job_id} failed: {message}")]
    JobFailed { job_id: i64, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Checkpoint '{key}' update lost {attempts} optimistic concurrency races")]
    CheckpointConflict { key: String, attempts: u32 },

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("Checkpoint store error: {0}")]
    CheckpointStore(String),

    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid time range: {0}")]
    InvalidRange(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Common(#[from] LakeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        IngestError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        IngestError::Internal(msg.into())
    }

    /// Classify for the caller's retry policy
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Cancelled => FailureKind::Cancelled,
            IngestError::BackendUnhealthy { .. }
            | IngestError::Oracle(_)
            | IngestError::CheckpointConflict { .. }
            | IngestError::Queue(_)
            | IngestError::CheckpointStore(_)
            | IngestError::Commit(_)
            | IngestError::Database(_)
            | IngestError::Http(_) => FailureKind::Retriable,
            IngestError::Common(LakeError::Io(_)) => FailureKind::Retriable,
            IngestError::JobFailed { .. }
            | IngestError::Config(_)
            | IngestError::InvalidRange(_)
            | IngestError::Internal(_)
            | IngestError::Common(_)
            | IngestError::Serialization(_) => FailureKind::NonRetriable,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind() == FailureKind::Retriable
    }
}
