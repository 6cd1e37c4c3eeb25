//! Candidate pool
//!
//! Undersized sub-jobs, possibly of many resource types, wait here until
//! their combined count reaches the low bound and then leave as one
//! multi-type job. A later sub-job of a type already pooled must continue
//! the pooled range exactly; the two are merged into one range.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::framework::types::{SubJobInfo, TimeRange};

/// A job's worth of `(resource type, range)` pairs with their counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitProcessingJob {
    pub split_parameters: BTreeMap<String, TimeRange>,
    pub resource_counts: BTreeMap<String, i64>,
}

impl SplitProcessingJob {
    pub fn single(sub_job: SubJobInfo) -> Self {
        Self {
            split_parameters: BTreeMap::from([(sub_job.resource_type.clone(), sub_job.range)]),
            resource_counts: BTreeMap::from([(sub_job.resource_type, sub_job.resource_count)]),
        }
    }

    pub fn resource_count(&self) -> i64 {
        self.resource_counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.split_parameters.is_empty()
    }
}

/// Where [`CandidatePool::place`] put a sub-job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// A job ready to dispatch: the sub-job alone, or the pool's contents
    /// once they reached the low bound
    Ready(SplitProcessingJob),
    /// Waiting in the pool
    Held,
    /// No records and nothing of its type pooled; only progress moves
    Empty(SubJobInfo),
}

#[derive(Debug)]
pub struct CandidatePool {
    low_bound: i64,
    pooled: SplitProcessingJob,
}

impl CandidatePool {
    pub fn new(low_bound: i64) -> Self {
        Self {
            low_bound,
            pooled: SplitProcessingJob::default(),
        }
    }

    pub fn pooled_count(&self) -> i64 {
        self.pooled.resource_count()
    }

    pub fn is_empty(&self) -> bool {
        self.pooled.is_empty()
    }

    /// Whether a range of `resource_type` is waiting in the pool. Later
    /// sub-jobs of that type must then go through the pool too.
    pub fn contains(&self, resource_type: &str) -> bool {
        self.pooled.split_parameters.contains_key(resource_type)
    }

    /// Route one sub-job. Undersized sub-jobs are pooled, as is every
    /// later sub-job of a type already in the pool so its pooled range
    /// stays contiguous. Empty sub-jobs produce no job, in-bounds sub-jobs
    /// go out alone.
    pub fn place(&mut self, sub_job: SubJobInfo) -> Result<Placement> {
        let undersized = sub_job.resource_count > 0 && sub_job.resource_count < self.low_bound;
        if undersized || self.contains(&sub_job.resource_type) {
            return Ok(match self.add(sub_job)? {
                Some(job) => Placement::Ready(job),
                None => Placement::Held,
            });
        }
        if sub_job.resource_count == 0 {
            return Ok(Placement::Empty(sub_job));
        }
        Ok(Placement::Ready(SplitProcessingJob::single(sub_job)))
    }

    /// Pool `sub_job`. Returns the merged job once the pooled count reaches
    /// the low bound.
    pub fn add(&mut self, sub_job: SubJobInfo) -> Result<Option<SplitProcessingJob>> {
        let resource_type = sub_job.resource_type;

        let range = match self.pooled.split_parameters.get(&resource_type) {
            Some(existing) if existing.is_followed_by(&sub_job.range) => TimeRange {
                start: existing.start,
                end: sub_job.range.end,
            },
            Some(existing) => {
                return Err(IngestError::internal(format!(
                    "{} sub-job {} does not continue pooled range {}",
                    resource_type, sub_job.range, existing
                )))
            },
            None => sub_job.range,
        };

        self.pooled.split_parameters.insert(resource_type.clone(), range);
        *self.pooled.resource_counts.entry(resource_type.clone()).or_insert(0) +=
            sub_job.resource_count;

        let pooled_count = self.pooled_count();
        debug!(resource_type = %resource_type, pooled_count, "Pooled sub-job");

        if pooled_count >= self.low_bound {
            return Ok(Some(std::mem::take(&mut self.pooled)));
        }
        Ok(None)
    }

    /// Whatever is left at end of stream, regardless of size
    pub fn flush_remaining(&mut self) -> Option<SplitProcessingJob> {
        if self.pooled.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pooled))
    }
}
