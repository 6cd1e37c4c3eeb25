//! Core types shared by the splitter, the pool and the orchestrator

use chrono::{DateTime, Utc};
use fhirlake_common::time::format_instant;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IngestError, Result};

/// Queue-assigned job identifier
pub type JobId = i64;

/// Half-open interval `[start, end)`. A missing start means "from the
/// beginning of time".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Result<Self> {
        if let Some(start) = start {
            if start >= end {
                return Err(IngestError::InvalidRange(format!(
                    "start {} is not before end {}",
                    format_instant(&start),
                    format_instant(&end)
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// True when `next` begins exactly where `self` ends
    pub fn is_followed_by(&self, next: &TimeRange) -> bool {
        next.start == Some(self.end)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(f, "[{}, {})", format_instant(&start), format_instant(&self.end)),
            None => write!(f, "[-inf, {})", format_instant(&self.end)),
        }
    }
}

/// One bounded slice of a single resource type, produced by the splitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubJobInfo {
    pub resource_type: String,
    pub range: TimeRange,
    pub resource_count: i64,
}

/// Result of a count probe. `Unknown` compares above every known count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCount {
    Known(i64),
    Unknown,
}

impl ResourceCount {
    pub fn value(self) -> Option<i64> {
        match self {
            ResourceCount::Known(n) => Some(n),
            ResourceCount::Unknown => None,
        }
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, ResourceCount::Unknown)
    }

    /// Shift a known count by `base`
    pub fn offset(self, base: i64) -> ResourceCount {
        match self {
            ResourceCount::Known(n) => ResourceCount::Known(base + n),
            ResourceCount::Unknown => ResourceCount::Unknown,
        }
    }

    /// Count relative to a cumulative `base`
    pub fn relative_to(self, base: i64) -> ResourceCount {
        match self {
            ResourceCount::Known(n) => ResourceCount::Known(n - base),
            ResourceCount::Unknown => ResourceCount::Unknown,
        }
    }
}

/// Processing job status as reported by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(IngestError::Queue(format!("unknown job status '{}'", other))),
        }
    }
}
