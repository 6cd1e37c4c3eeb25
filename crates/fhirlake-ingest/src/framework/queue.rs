//! Job queue contract and an in-memory queue
//!
//! `enqueue` is idempotent per job identity: submitting a definition whose
//! identity is already known returns the existing job instead of creating a
//! second one. That is what lets the orchestrator blindly resubmit a
//! half-finished dispatch after a crash.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::types::{JobId, JobStatus};
use crate::error::{IngestError, Result};
use crate::jobs::{ProcessingJobInputData, ProcessingJobResult};

/// A definition plus the identity the queue deduplicates on
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub identity: String,
    pub definition: ProcessingJobInputData,
}

/// Queue-side view of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: JobId,
    pub group_id: i64,
    pub identity: String,
    pub status: JobStatus,
    pub definition: ProcessingJobInputData,
    /// Present once the job completed
    pub result: Option<serde_json::Value>,
    /// Present once the job failed
    pub error: Option<String>,
}

impl JobInfo {
    /// Decode the completion payload; a missing payload is an empty result
    pub fn parsed_result(&self) -> Result<ProcessingJobResult> {
        match &self.result {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(ProcessingJobResult::default()),
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue definitions under `group_id`, returning one handle per input in
    /// input order
    async fn enqueue(&self, group_id: i64, jobs: Vec<QueuedJob>) -> Result<Vec<JobInfo>>;

    /// Current state of the given jobs. Unknown ids are omitted.
    async fn get_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<JobInfo>>;
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: JobId,
    jobs: BTreeMap<JobId, JobInfo>,
    by_identity: HashMap<String, JobId>,
}

/// Process-local queue for tests and dry runs
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job, ordered by id
    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    /// Jobs not yet in a terminal state
    pub async fn active_count(&self) -> usize {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .count()
    }

    pub async fn complete(&self, id: JobId, result: &ProcessingJobResult) -> Result<()> {
        let payload = serde_json::to_value(result)?;
        self.transition(id, |job| {
            job.status = JobStatus::Completed;
            job.result = Some(payload);
        })
        .await
    }

    pub async fn fail(&self, id: JobId, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.transition(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(message);
        })
        .await
    }

    pub async fn cancel(&self, id: JobId) -> Result<()> {
        self.transition(id, |job| job.status = JobStatus::Cancelled)
            .await
    }

    pub async fn start(&self, id: JobId) -> Result<()> {
        self.transition(id, |job| job.status = JobStatus::Running)
            .await
    }

    async fn transition(&self, id: JobId, apply: impl FnOnce(&mut JobInfo)) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| IngestError::Queue(format!("job {} not found", id)))?;
        apply(job);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, group_id: i64, jobs: Vec<QueuedJob>) -> Result<Vec<JobInfo>> {
        let mut state = self.state.lock().await;
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            if let Some(existing) = state.by_identity.get(&job.identity) {
                let existing = state.jobs.get(existing).cloned().ok_or_else(|| {
                    IngestError::Queue(format!("identity index points at missing job {}", existing))
                })?;
                handles.push(existing);
                continue;
            }

            state.next_id += 1;
            let info = JobInfo {
                id: state.next_id,
                group_id,
                identity: job.identity.clone(),
                status: JobStatus::Created,
                definition: job.definition,
                result: None,
                error: None,
            };
            state.by_identity.insert(job.identity, info.id);
            state.jobs.insert(info.id, info.clone());
            handles.push(info);
        }

        Ok(handles)
    }

    async fn get_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<JobInfo>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }
}
