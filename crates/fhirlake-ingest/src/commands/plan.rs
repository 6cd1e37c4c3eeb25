//! `fhirlake-ingest plan`
//!
//! Dry run of the dispatch phase: splits every resource type against the
//! FHIR server (or cuts fixed spans, for older job versions) and prints the
//! jobs an orchestrator would enqueue, without touching the queue or a
//! checkpoint.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{dedup_resource_types, IngestConfig};
use crate::error::Result;
use crate::fhir::FhirSearchOracle;
use crate::framework::oracle::ResourceCountOracle;
use crate::splitter::{span_interval, CandidatePool, FixedSpanCursor, JobSplitter, Placement};
use crate::versioning::SplitMode;

pub async fn run(
    config: &IngestConfig,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    resource_types: &[String],
    cancel: CancellationToken,
) -> Result<()> {
    let oracle: Arc<dyn ResourceCountOracle> = Arc::new(FhirSearchOracle::new(&config.fhir)?);
    let end = end.unwrap_or_else(Utc::now);
    let resource_types = if resource_types.is_empty() {
        config.resource_types.clone()
    } else {
        dedup_resource_types(resource_types)
    };

    let planned = match config.orchestrator.job_version.split_mode() {
        SplitMode::Adaptive => plan_adaptive(config, oracle, start, end, &resource_types, cancel).await?,
        SplitMode::FixedTimespan { start_at_record } => {
            let interval = span_interval(
                start,
                end,
                config.orchestrator.initial_interval(),
                config.orchestrator.incremental_interval(),
            )?;
            let mut cursor = FixedSpanCursor::new(
                oracle,
                resource_types,
                interval,
                start_at_record,
                config.split.count_timeout(),
                cancel,
                start,
                None,
                end,
            );
            let mut planned = 0usize;
            while let Some(span) = cursor.next_span().await? {
                print_job(&span)?;
                planned += 1;
            }
            planned
        },
    };

    info!(jobs = planned, end = %end, "Plan complete");
    Ok(())
}

async fn plan_adaptive(
    config: &IngestConfig,
    oracle: Arc<dyn ResourceCountOracle>,
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    resource_types: &[String],
    cancel: CancellationToken,
) -> Result<usize> {
    let splitter = JobSplitter::new(oracle, config.split.clone())?;
    let mut pool = CandidatePool::new(splitter.bounds().low);
    let mut planned = 0usize;

    for resource_type in resource_types {
        let sub_jobs = splitter
            .split(resource_type.clone(), start, end, cancel.clone())?
            .into_stream();
        futures::pin_mut!(sub_jobs);

        while let Some(sub_job) = sub_jobs.try_next().await? {
            if let Placement::Ready(job) = pool.place(sub_job)? {
                print_job(&job)?;
                planned += 1;
            }
        }
    }

    if let Some(job) = pool.flush_remaining() {
        print_job(&job)?;
        planned += 1;
    }
    Ok(planned)
}

fn print_job<T: Serialize>(job: &T) -> Result<()> {
    println!("{}", serde_json::to_string(job)?);
    Ok(())
}
