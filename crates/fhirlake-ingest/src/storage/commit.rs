//! Commit log in `committed_jobs`

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;
use crate::framework::commit::CommitHook;
use crate::framework::types::JobId;

#[derive(Clone)]
pub struct PgCommitLog {
    pool: PgPool,
}

impl PgCommitLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommitHook for PgCommitLog {
    async fn commit(&self, job_id: JobId) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO committed_jobs (job_id)
            VALUES ($1)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        debug!(job_id, first_commit = result.rows_affected() == 1, "Committed job");
        Ok(())
    }
}
