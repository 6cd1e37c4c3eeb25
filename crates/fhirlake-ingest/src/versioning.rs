//! Job versions
//!
//! Each generation of the pipeline is a closed variant with one static
//! profile: the input fields that make up a job's identity, how the
//! orchestrator tracks running jobs, and how system-scope runs are cut into
//! jobs. Identity never depends on the queue
//! implementation, only on the `job_version` carried by the definition.

use fhirlake_common::fingerprint::fingerprint_fields;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IngestError, Result};
use crate::jobs::ProcessingJobInputData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobVersion {
    V1,
    V2,
    V3,
    V4,
}

/// Running-job tracking strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStrategy {
    /// Any completed job is removed as soon as it is seen
    Unordered,
    /// Only the oldest outstanding job is polled; progress is strictly in
    /// submission order
    Ordered,
}

/// How a system-scope run is cut into processing jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitMode {
    /// Consecutive windows of a fixed length over all resource types, each
    /// opened by the next record. With `start_at_record` a window starts at
    /// that record instead of at the end of the previous window.
    FixedTimespan { start_at_record: bool },
    /// Per resource type windows bounded by record count
    Adaptive,
}

/// Input fields that can participate in a job identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    JobType,
    TriggerSequenceId,
    SequenceId,
    Since,
    DataStartTime,
    DataEndTime,
    SplitParameters,
    ToBeProcessedPatients,
}

impl IdentityField {
    /// Wire name in the serialized definition
    pub fn key(self) -> &'static str {
        match self {
            IdentityField::JobType => "jobType",
            IdentityField::TriggerSequenceId => "triggerSequenceId",
            IdentityField::SequenceId => "sequenceId",
            IdentityField::Since => "since",
            IdentityField::DataStartTime => "dataStartTime",
            IdentityField::DataEndTime => "dataEndTime",
            IdentityField::SplitParameters => "splitParameters",
            IdentityField::ToBeProcessedPatients => "toBeProcessedPatients",
        }
    }
}

#[derive(Debug)]
pub struct VersionProfile {
    pub identity_fields: &'static [IdentityField],
    pub tracking: TrackingStrategy,
    pub split_mode: SplitMode,
}

const V1_PROFILE: VersionProfile = VersionProfile {
    identity_fields: &[
        IdentityField::JobType,
        IdentityField::TriggerSequenceId,
        IdentityField::SequenceId,
        IdentityField::Since,
        IdentityField::DataStartTime,
        IdentityField::DataEndTime,
        IdentityField::ToBeProcessedPatients,
    ],
    tracking: TrackingStrategy::Unordered,
    split_mode: SplitMode::FixedTimespan {
        start_at_record: true,
    },
};

const V2_PROFILE: VersionProfile = VersionProfile {
    identity_fields: &[
        IdentityField::JobType,
        IdentityField::TriggerSequenceId,
        IdentityField::SequenceId,
        IdentityField::Since,
        IdentityField::DataStartTime,
        IdentityField::ToBeProcessedPatients,
    ],
    tracking: TrackingStrategy::Unordered,
    split_mode: SplitMode::FixedTimespan {
        start_at_record: false,
    },
};

const V3_PROFILE: VersionProfile = VersionProfile {
    identity_fields: V2_PROFILE.identity_fields,
    tracking: TrackingStrategy::Ordered,
    split_mode: V2_PROFILE.split_mode,
};

const V4_PROFILE: VersionProfile = VersionProfile {
    identity_fields: &[
        IdentityField::JobType,
        IdentityField::TriggerSequenceId,
        IdentityField::SequenceId,
        IdentityField::Since,
        IdentityField::DataStartTime,
        IdentityField::ToBeProcessedPatients,
        IdentityField::SplitParameters,
    ],
    tracking: TrackingStrategy::Ordered,
    split_mode: SplitMode::Adaptive,
};

impl JobVersion {
    pub const LATEST: JobVersion = JobVersion::V4;

    pub fn profile(self) -> &'static VersionProfile {
        match self {
            JobVersion::V1 => &V1_PROFILE,
            JobVersion::V2 => &V2_PROFILE,
            JobVersion::V3 => &V3_PROFILE,
            JobVersion::V4 => &V4_PROFILE,
        }
    }

    pub fn tracking(self) -> TrackingStrategy {
        self.profile().tracking
    }

    pub fn split_mode(self) -> SplitMode {
        self.profile().split_mode
    }

    pub fn identity_keys(self) -> Vec<&'static str> {
        self.profile()
            .identity_fields
            .iter()
            .map(|field| field.key())
            .collect()
    }
}

impl fmt::Display for JobVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobVersion::V1 => "v1",
            JobVersion::V2 => "v2",
            JobVersion::V3 => "v3",
            JobVersion::V4 => "v4",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for JobVersion {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "v1" | "1" => Ok(JobVersion::V1),
            "v2" | "2" => Ok(JobVersion::V2),
            "v3" | "3" => Ok(JobVersion::V3),
            "v4" | "4" => Ok(JobVersion::V4),
            other => Err(IngestError::config(format!("unknown job version '{}'", other))),
        }
    }
}

/// Deterministic identity of a processing job, selected by its own version
pub fn job_identity(job: &ProcessingJobInputData) -> Result<String> {
    let keys = job.job_version.identity_keys();
    Ok(fingerprint_fields(job, &keys)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::types::TimeRange;
    use crate::jobs::JobType;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn job(version: JobVersion) -> ProcessingJobInputData {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        ProcessingJobInputData {
            job_type: JobType::Processing,
            job_version: version,
            trigger_sequence_id: 3,
            sequence_id: 12,
            since: None,
            data_start_time: Some(start),
            data_end_time: end,
            split_parameters: BTreeMap::from([(
                "Patient".to_string(),
                TimeRange::new(Some(start), end).unwrap(),
            )]),
            to_be_processed_patients: None,
        }
    }

    #[test]
    fn test_identity_is_stable() {
        let a = job(JobVersion::V4);
        assert_eq!(job_identity(&a).unwrap(), job_identity(&a.clone()).unwrap());
    }

    #[test]
    fn test_v1_hashes_data_end_time_but_v2_does_not() {
        let later = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let v1 = job(JobVersion::V1);
        let v1_moved = ProcessingJobInputData { data_end_time: later, ..v1.clone() };
        assert_ne!(job_identity(&v1).unwrap(), job_identity(&v1_moved).unwrap());

        let v2 = job(JobVersion::V2);
        let v2_moved = ProcessingJobInputData { data_end_time: later, ..v2.clone() };
        assert_eq!(job_identity(&v2).unwrap(), job_identity(&v2_moved).unwrap());
    }

    #[test]
    fn test_only_v4_hashes_split_parameters() {
        for version in [JobVersion::V3, JobVersion::V4] {
            let original = job(version);
            let mut changed = original.clone();
            changed.split_parameters.clear();
            let same = job_identity(&original).unwrap() == job_identity(&changed).unwrap();
            assert_eq!(same, version == JobVersion::V3, "version {}", version);
        }
    }

    #[test]
    fn test_job_version_is_not_part_of_identity() {
        // V2 and V3 share the field table, so only the version differs
        assert_eq!(
            job_identity(&job(JobVersion::V2)).unwrap(),
            job_identity(&job(JobVersion::V3)).unwrap()
        );
    }

    #[test]
    fn test_tracking_per_version() {
        assert_eq!(JobVersion::V1.tracking(), TrackingStrategy::Unordered);
        assert_eq!(JobVersion::V2.tracking(), TrackingStrategy::Unordered);
        assert_eq!(JobVersion::V3.tracking(), TrackingStrategy::Ordered);
        assert_eq!(JobVersion::LATEST.tracking(), TrackingStrategy::Ordered);
    }

    #[test]
    fn test_only_v4_splits_adaptively() {
        assert_eq!(
            JobVersion::V1.split_mode(),
            SplitMode::FixedTimespan { start_at_record: true }
        );
        assert_eq!(
            JobVersion::V2.split_mode(),
            SplitMode::FixedTimespan { start_at_record: false }
        );
        assert_eq!(JobVersion::V3.split_mode(), JobVersion::V2.split_mode());
        assert_eq!(JobVersion::V4.split_mode(), SplitMode::Adaptive);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!("V3".parse::<JobVersion>().unwrap(), JobVersion::V3);
        assert_eq!("4".parse::<JobVersion>().unwrap(), JobVersion::V4);
        assert!("v9".parse::<JobVersion>().is_err());
    }
}
