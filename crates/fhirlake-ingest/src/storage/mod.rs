//! Postgres implementations of the collaborator traits

pub mod checkpoint;
pub mod commit;
pub mod patients;
pub mod queue;

pub use checkpoint::PgCheckpointStore;
pub use commit::PgCommitLog;
pub use patients::PgGroupPatientSource;
pub use queue::PgJobQueue;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::{IngestError, Result};

/// Connect and apply the bundled migrations
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| IngestError::CheckpointStore(format!("Migration failed: {}", e)))?;

    info!(max_connections, "Connected to database");
    Ok(pool)
}
