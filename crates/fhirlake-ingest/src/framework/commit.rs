//! Commit hook, invoked once a processing job's output is final

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::types::JobId;
use crate::error::Result;

#[async_trait]
pub trait CommitHook: Send + Sync {
    /// Must be idempotent: a resumed run may commit the same job twice
    async fn commit(&self, job_id: JobId) -> Result<()>;
}

/// Commits nothing
pub struct NoopCommitHook;

#[async_trait]
impl CommitHook for NoopCommitHook {
    async fn commit(&self, _job_id: JobId) -> Result<()> {
        Ok(())
    }
}

/// Records commits in order, for tests and dry runs
#[derive(Default)]
pub struct RecordingCommitHook {
    committed: Mutex<Vec<JobId>>,
}

impl RecordingCommitHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn committed(&self) -> Vec<JobId> {
        self.committed.lock().await.clone()
    }
}

#[async_trait]
impl CommitHook for RecordingCommitHook {
    async fn commit(&self, job_id: JobId) -> Result<()> {
        self.committed.lock().await.push(job_id);
        Ok(())
    }
}
