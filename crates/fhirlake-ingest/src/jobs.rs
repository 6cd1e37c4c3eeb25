//! Processing job definitions and results
//!
//! [`ProcessingJobInputData`] is the only artifact handed to the downstream
//! processing jobs. Its `split_parameters` map is authoritative: a job covers
//! exactly those `(resource type, range)` pairs and nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::framework::types::TimeRange;
use crate::versioning::JobVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Orchestrator,
    Processing,
}

/// A patient selected for a group-scoped job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientWrapper {
    /// Fingerprint of the patient id
    pub patient_hash: String,
    /// Last processed version, 0 when never processed
    pub version_id: i64,
}

/// Unit of work handed to the queue. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJobInputData {
    pub job_type: JobType,
    pub job_version: JobVersion,
    pub trigger_sequence_id: i64,
    pub sequence_id: i64,
    pub since: Option<DateTime<Utc>>,
    pub data_start_time: Option<DateTime<Utc>>,
    pub data_end_time: DateTime<Utc>,
    #[serde(default)]
    pub split_parameters: BTreeMap<String, TimeRange>,
    #[serde(default)]
    pub to_be_processed_patients: Option<Vec<PatientWrapper>>,
}

impl ProcessingJobInputData {
    pub fn patient_count(&self) -> usize {
        self.to_be_processed_patients.as_ref().map_or(0, Vec::len)
    }

    /// A fixed-timespan job covers every resource type over
    /// `[data_start_time, data_end_time)` and carries no split parameters
    pub fn is_fixed_span(&self) -> bool {
        self.split_parameters.is_empty() && self.to_be_processed_patients.is_none()
    }
}

/// Counters reported by processing jobs and aggregated by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    #[serde(default)]
    pub search_count: BTreeMap<String, i64>,
    #[serde(default)]
    pub processed_count: BTreeMap<String, i64>,
    #[serde(default)]
    pub skipped_count: BTreeMap<String, i64>,
    #[serde(default)]
    pub processed_count_in_total: i64,
    #[serde(default)]
    pub processed_data_size_in_total: i64,
}

impl JobStatistics {
    /// Sum of `self` and `other`, leaving both untouched
    pub fn merged(&self, other: &JobStatistics) -> JobStatistics {
        JobStatistics {
            search_count: merge_counts(&self.search_count, &other.search_count),
            processed_count: merge_counts(&self.processed_count, &other.processed_count),
            skipped_count: merge_counts(&self.skipped_count, &other.skipped_count),
            processed_count_in_total: self.processed_count_in_total
                + other.processed_count_in_total,
            processed_data_size_in_total: self.processed_data_size_in_total
                + other.processed_data_size_in_total,
        }
    }
}

fn merge_counts(a: &BTreeMap<String, i64>, b: &BTreeMap<String, i64>) -> BTreeMap<String, i64> {
    let mut merged = a.clone();
    for (key, value) in b {
        *merged.entry(key.clone()).or_insert(0) += value;
    }
    merged
}

/// Result payload attached to a completed processing job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJobResult {
    #[serde(flatten)]
    pub statistics: JobStatistics,
    /// Patient hash to the version just processed (group scope only)
    #[serde(default)]
    pub processed_patient_versions: Option<BTreeMap<String, i64>>,
}
