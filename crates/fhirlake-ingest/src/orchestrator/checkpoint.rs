//! Orchestrator checkpoint
//!
//! The checkpoint is a value, never mutated in place: every step derives a new
//! checkpoint from the current one and the [`CheckpointWriter`] swaps it in
//! with an optimistic write. When the write loses a race, the writer re-reads
//! and re-applies the same step to the fresh value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::tracking::RunningJobs;
use crate::error::{IngestError, Result};
use crate::framework::checkpoint_store::CheckpointStore;
use crate::framework::types::JobId;
use crate::jobs::{JobStatistics, ProcessingJobInputData};
use crate::versioning::TrackingStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorCheckpoint {
    pub start_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub created_job_count: i64,
    pub completed_job_count: i64,
    /// Definition persisted right before an enqueue, cleared right after
    pub submitting_job: Option<ProcessingJobInputData>,
    /// Per resource type, everything before this instant has been dispatched
    pub submitted_resource_timestamps: BTreeMap<String, DateTime<Utc>>,
    /// Fixed-timespan runs: end of the last dispatched window
    #[serde(default)]
    pub next_job_timestamp: Option<DateTime<Utc>>,
    /// Group scope: patients before this index have been dispatched
    #[serde(default)]
    pub next_patient_index: usize,
    pub running_jobs: RunningJobs,
    pub statistics: JobStatistics,
}

impl OrchestratorCheckpoint {
    pub fn new(strategy: TrackingStrategy, start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            complete_time: None,
            created_job_count: 0,
            completed_job_count: 0,
            submitting_job: None,
            submitted_resource_timestamps: BTreeMap::new(),
            next_job_timestamp: None,
            next_patient_index: 0,
            running_jobs: RunningJobs::empty(strategy),
            statistics: JobStatistics::default(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running_jobs.len()
    }

    pub fn submitted_until(&self, resource_type: &str) -> Option<DateTime<Utc>> {
        self.submitted_resource_timestamps.get(resource_type).copied()
    }

    pub fn with_submitting(&self, job: &ProcessingJobInputData) -> Self {
        Self {
            submitting_job: Some(job.clone()),
            ..self.clone()
        }
    }

    /// Record a successful enqueue of `job` as `job_id`
    pub fn with_dispatched(&self, job: &ProcessingJobInputData, job_id: JobId) -> Self {
        let mut next = self.clone();
        next.submitting_job = None;
        next.created_job_count += 1;
        next.running_jobs = self.running_jobs.with_inserted(job.sequence_id, job_id);
        for (resource_type, range) in &job.split_parameters {
            next = next.with_advanced(resource_type, range.end);
        }
        if job.is_fixed_span() {
            next = next.with_next_job_timestamp(job.data_end_time);
        }
        next.next_patient_index += job.patient_count();
        next
    }

    /// Move fixed-timespan progress forward; never moves it back
    pub fn with_next_job_timestamp(&self, until: DateTime<Utc>) -> Self {
        Self {
            next_job_timestamp: Some(self.next_job_timestamp.map_or(until, |at| at.max(until))),
            ..self.clone()
        }
    }

    /// Move a resource type's progress forward; never moves it back
    pub fn with_advanced(&self, resource_type: &str, until: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        let entry = next
            .submitted_resource_timestamps
            .entry(resource_type.to_string())
            .or_insert(until);
        if *entry < until {
            *entry = until;
        }
        next
    }

    /// Fold a completed job into the aggregates
    pub fn with_completed(&self, job_id: JobId, statistics: &JobStatistics) -> Self {
        if !self.running_jobs.contains(job_id) {
            return self.clone();
        }
        Self {
            running_jobs: self.running_jobs.with_removed(job_id),
            completed_job_count: self.completed_job_count + 1,
            statistics: self.statistics.merged(statistics),
            ..self.clone()
        }
    }

    pub fn with_complete_time(&self, at: DateTime<Utc>) -> Self {
        Self {
            complete_time: Some(at),
            ..self.clone()
        }
    }
}

/// Owns the current checkpoint and its store version
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    key: String,
    current: OrchestratorCheckpoint,
    version: i64,
    max_retries: u32,
}

impl CheckpointWriter {
    /// Load the checkpoint for `key`, creating `fresh` if none exists
    pub async fn load_or_create(
        store: Arc<dyn CheckpointStore>,
        key: impl Into<String>,
        fresh: OrchestratorCheckpoint,
        max_retries: u32,
    ) -> Result<Self> {
        let key = key.into();

        for _ in 0..=max_retries {
            if let Some(existing) = store.get(&key).await? {
                debug!(checkpoint_key = %key, version = existing.version, "Loaded checkpoint");
                return Ok(Self {
                    store,
                    key,
                    current: existing.checkpoint,
                    version: existing.version,
                    max_retries,
                });
            }

            if store.try_add(&key, &fresh).await? {
                debug!(checkpoint_key = %key, "Created checkpoint");
                return Ok(Self {
                    store,
                    key,
                    current: fresh,
                    version: 1,
                    max_retries,
                });
            }
        }

        Err(IngestError::CheckpointConflict {
            key,
            attempts: max_retries + 1,
        })
    }

    pub fn current(&self) -> &OrchestratorCheckpoint {
        &self.current
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Persist `step(current)`. On a lost race, re-read and re-apply `step`,
    /// at most `max_retries` times.
    pub async fn apply<F>(&mut self, step: F) -> Result<&OrchestratorCheckpoint>
    where
        F: Fn(&OrchestratorCheckpoint) -> OrchestratorCheckpoint,
    {
        let mut attempt = 0;
        loop {
            let next = step(&self.current);
            if self.store.try_update(&self.key, &next, self.version).await? {
                self.current = next;
                self.version += 1;
                return Ok(&self.current);
            }

            attempt += 1;
            if attempt > self.max_retries {
                return Err(IngestError::CheckpointConflict {
                    key: self.key.clone(),
                    attempts: attempt,
                });
            }

            warn!(
                checkpoint_key = %self.key,
                expected_version = self.version,
                attempt,
                "Checkpoint write conflicted, re-reading"
            );
            let latest = self.store.get(&self.key).await?.ok_or_else(|| {
                IngestError::CheckpointStore(format!("checkpoint '{}' disappeared", self.key))
            })?;
            self.current = latest.checkpoint;
            self.version = latest.version;
        }
    }
}
