//! Checkpoints in `orchestrator_checkpoints`

use async_trait::async_trait;
use sqlx::{types::Json, PgPool, Row};

use crate::error::Result;
use crate::framework::checkpoint_store::{CheckpointStore, VersionedCheckpoint};
use crate::orchestrator::checkpoint::OrchestratorCheckpoint;

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT version, checkpoint
            FROM orchestrator_checkpoints
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version")?;
                let Json(checkpoint): Json<OrchestratorCheckpoint> = row.try_get("checkpoint")?;
                Ok(Some(VersionedCheckpoint {
                    checkpoint,
                    version,
                }))
            },
            None => Ok(None),
        }
    }

    async fn try_add(&self, key: &str, checkpoint: &OrchestratorCheckpoint) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO orchestrator_checkpoints (key, version, checkpoint)
            VALUES ($1, 1, $2)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(Json(checkpoint))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_update(
        &self,
        key: &str,
        checkpoint: &OrchestratorCheckpoint,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orchestrator_checkpoints
            SET checkpoint = $2, version = version + 1, updated_at = NOW()
            WHERE key = $1 AND version = $3
            "#,
        )
        .bind(key)
        .bind(Json(checkpoint))
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
