//! `fhirlake-ingest run`

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::fhir::FhirSearchOracle;
use crate::orchestrator::{Orchestrator, OrchestratorInput};
use crate::storage::{self, PgCheckpointStore, PgCommitLog, PgGroupPatientSource, PgJobQueue};

pub async fn run(
    config: &IngestConfig,
    input: OrchestratorInput,
    cancel: CancellationToken,
) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| IngestError::config("DATABASE_URL is required for run"))?;
    let pool = storage::connect(database_url, 5).await?;
    let fhir = FhirSearchOracle::new(&config.fhir)?;

    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        config.split.clone(),
        Arc::new(fhir.clone()),
        Arc::new(PgJobQueue::new(pool.clone())),
        Arc::new(PgCheckpointStore::new(pool.clone())),
        Arc::new(PgCommitLog::new(pool.clone())),
    )?
    .with_patient_source(Arc::new(PgGroupPatientSource::new(fhir, pool)));

    let mut progress = orchestrator.subscribe();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            info!(
                state = snapshot.state.as_str(),
                created = snapshot.created_job_count,
                completed = snapshot.completed_job_count,
                running = snapshot.running_job_count,
                "Progress"
            );
        }
    });

    let result = orchestrator.run(&input, cancel).await;
    drop(orchestrator);
    let _ = reporter.await;

    let outcome = result?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
