//! `fhirlake-ingest status`

use chrono::{DateTime, Utc};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::framework::checkpoint_store::CheckpointStore;
use crate::orchestrator::pending_resource_types;
use crate::storage::{self, PgCheckpointStore};

pub async fn run(
    config: &IngestConfig,
    checkpoint_key: &str,
    end: Option<DateTime<Utc>>,
) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| IngestError::config("DATABASE_URL is required for status"))?;
    let pool = storage::connect(database_url, 1).await?;
    let store = PgCheckpointStore::new(pool);

    let Some(stored) = store.get(checkpoint_key).await? else {
        println!("No checkpoint stored under '{}'.", checkpoint_key);
        return Ok(());
    };
    let checkpoint = &stored.checkpoint;

    println!("Checkpoint '{}' (version {})", checkpoint_key, stored.version);
    println!("  Started:   {}", checkpoint.start_time);
    match checkpoint.complete_time {
        Some(at) => println!("  Completed: {}", at),
        None => println!("  Completed: -"),
    }
    println!(
        "  Jobs:      {} created, {} completed, {} running",
        checkpoint.created_job_count,
        checkpoint.completed_job_count,
        checkpoint.running_count()
    );
    println!(
        "  Processed: {} records, {} bytes",
        checkpoint.statistics.processed_count_in_total,
        checkpoint.statistics.processed_data_size_in_total
    );
    if let Some(pending) = &checkpoint.submitting_job {
        println!("  Pending dispatch: sequence {}", pending.sequence_id);
    }
    if let Some(at) = checkpoint.next_job_timestamp {
        println!("  Fixed spans dispatched up to {}", at);
    }

    if let Some(end) = end {
        let pending = pending_resource_types(checkpoint, &config.resource_types, end);
        if pending.is_empty() {
            println!("  All resource types dispatched up to {}", end);
        }
        for (resource_type, submitted) in pending {
            match submitted {
                Some(ts) => println!("  {:<20} dispatched up to {}", resource_type, ts),
                None => println!("  {:<20} not started", resource_type),
            }
        }
    }

    Ok(())
}
