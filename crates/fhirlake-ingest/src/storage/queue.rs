//! Processing job queue in `processing_jobs`
//!
//! The unique `identity` column makes `enqueue` idempotent: a duplicate
//! insert is dropped and the existing row is returned instead.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use std::collections::HashMap;

use crate::error::{IngestError, Result};
use crate::framework::queue::{JobInfo, JobQueue, QueuedJob};
use crate::framework::types::{JobId, JobStatus};
use crate::jobs::ProcessingJobInputData;

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn job_from_row(row: &PgRow) -> Result<JobInfo> {
        let status: String = row.try_get("status")?;
        let Json(definition): Json<ProcessingJobInputData> = row.try_get("definition")?;
        let result: Option<Json<serde_json::Value>> = row.try_get("result")?;

        Ok(JobInfo {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            identity: row.try_get("identity")?,
            status: status.parse::<JobStatus>()?,
            definition,
            result: result.map(|Json(value)| value),
            error: row.try_get("error")?,
        })
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, group_id: i64, jobs: Vec<QueuedJob>) -> Result<Vec<JobInfo>> {
        let mut tx = self.pool.begin().await?;
        let identities: Vec<String> = jobs.iter().map(|job| job.identity.clone()).collect();

        for job in &jobs {
            sqlx::query(
                r#"
                INSERT INTO processing_jobs (group_id, identity, status, definition)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (identity) DO NOTHING
                "#,
            )
            .bind(group_id)
            .bind(&job.identity)
            .bind(JobStatus::Created.as_str())
            .bind(Json(&job.definition))
            .execute(&mut *tx)
            .await?;
        }

        let rows = sqlx::query(
            r#"
            SELECT id, group_id, identity, status, definition, result, error
            FROM processing_jobs
            WHERE identity = ANY($1)
            "#,
        )
        .bind(&identities)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut by_identity = HashMap::with_capacity(rows.len());
        for row in &rows {
            let job = Self::job_from_row(row)?;
            by_identity.insert(job.identity.clone(), job);
        }

        identities
            .iter()
            .map(|identity| {
                by_identity.get(identity).cloned().ok_or_else(|| {
                    IngestError::Queue(format!("job with identity {} was not stored", identity))
                })
            })
            .collect()
    }

    async fn get_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<JobInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, group_id, identity, status, definition, result, error
            FROM processing_jobs
            WHERE id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::job_from_row).collect()
    }
}
