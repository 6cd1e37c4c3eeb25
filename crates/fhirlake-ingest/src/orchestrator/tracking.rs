//! Running-job bookkeeping
//!
//! Two representations exist, one per [`TrackingStrategy`]. The ordered form
//! keys jobs by their submission sequence so the oldest outstanding job is
//! always the first entry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::framework::types::JobId;
use crate::versioning::TrackingStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "jobs", rename_all = "snake_case")]
pub enum RunningJobs {
    Unordered(BTreeSet<JobId>),
    /// sequence id -> job id
    Ordered(BTreeMap<i64, JobId>),
}

impl RunningJobs {
    pub fn empty(strategy: TrackingStrategy) -> Self {
        match strategy {
            TrackingStrategy::Unordered => RunningJobs::Unordered(BTreeSet::new()),
            TrackingStrategy::Ordered => RunningJobs::Ordered(BTreeMap::new()),
        }
    }

    pub fn strategy(&self) -> TrackingStrategy {
        match self {
            RunningJobs::Unordered(_) => TrackingStrategy::Unordered,
            RunningJobs::Ordered(_) => TrackingStrategy::Ordered,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RunningJobs::Unordered(ids) => ids.len(),
            RunningJobs::Ordered(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        match self {
            RunningJobs::Unordered(ids) => ids.contains(&job_id),
            RunningJobs::Ordered(ids) => ids.values().any(|id| *id == job_id),
        }
    }

    /// Jobs to ask the queue about on the next check
    pub fn ids_to_poll(&self) -> Vec<JobId> {
        match self {
            RunningJobs::Unordered(ids) => ids.iter().copied().collect(),
            RunningJobs::Ordered(ids) => ids.values().next().copied().into_iter().collect(),
        }
    }

    pub fn with_inserted(&self, sequence_id: i64, job_id: JobId) -> Self {
        let mut next = self.clone();
        match &mut next {
            RunningJobs::Unordered(ids) => {
                ids.insert(job_id);
            },
            RunningJobs::Ordered(ids) => {
                ids.insert(sequence_id, job_id);
            },
        }
        next
    }

    pub fn with_removed(&self, job_id: JobId) -> Self {
        let mut next = self.clone();
        match &mut next {
            RunningJobs::Unordered(ids) => {
                ids.remove(&job_id);
            },
            RunningJobs::Ordered(ids) => ids.retain(|_, id| *id != job_id),
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_polls_only_oldest() {
        let running = RunningJobs::empty(TrackingStrategy::Ordered)
            .with_inserted(2, 30)
            .with_inserted(0, 10)
            .with_inserted(1, 20);
        assert_eq!(running.ids_to_poll(), vec![10]);

        let running = running.with_removed(10);
        assert_eq!(running.ids_to_poll(), vec![20]);
        assert_eq!(running.len(), 2);
    }

    #[test]
    fn test_unordered_polls_everything() {
        let running = RunningJobs::empty(TrackingStrategy::Unordered)
            .with_inserted(0, 5)
            .with_inserted(1, 3);
        assert_eq!(running.ids_to_poll(), vec![3, 5]);
        assert!(running.with_removed(3).contains(5));
        assert!(!running.with_removed(3).contains(3));
    }
}
