//! Orchestrator engine
//!
//! Drives the splitter and the candidate pool across the configured resource
//! types (or, for older job versions, fixed-length windows over all of them),
//! enqueues the resulting processing jobs under a concurrency cap,
//! polls them to completion, folds their statistics into the checkpoint and
//! persists it after every step, so a restarted run picks up exactly where
//! the previous one stopped.
//!
//! ```text
//! Initializing -> Dispatching -> Draining -> Completed
//!        \______________\____________\_____> Cancelled | Failed
//! ```
//!
//! Control flow is sequential: the engine only suspends on the oracle, the
//! queue, the checkpoint store and the poll delay, and checks for
//! cancellation between steps. Jobs already enqueued belong to the queue and
//! are never cancelled from here.

pub mod checkpoint;
pub mod tracking;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::checkpoint::{CheckpointWriter, OrchestratorCheckpoint};
use crate::config::{OrchestratorConfig, SplitConfig};
use crate::error::{FailureKind, IngestError, Result};
use crate::framework::checkpoint_store::CheckpointStore;
use crate::framework::commit::CommitHook;
use crate::framework::oracle::ResourceCountOracle;
use crate::framework::patients::PatientSource;
use crate::framework::queue::{JobInfo, JobQueue, QueuedJob};
use crate::framework::types::{JobStatus, TimeRange};
use crate::jobs::{JobStatistics, JobType, PatientWrapper, ProcessingJobInputData};
use crate::splitter::{span_interval, CandidatePool, FixedSpanCursor, JobSplitter, Placement};
use crate::versioning::{job_identity, SplitMode, TrackingStrategy};

/// Which records a run covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterScope {
    /// Every record of the configured resource types
    System,
    /// Members of one patient group, batched by patient
    Group { group_id: String },
}

/// One orchestrator run
#[derive(Debug, Clone)]
pub struct OrchestratorInput {
    pub trigger_sequence_id: i64,
    /// Queue group the processing jobs are enqueued under
    pub queue_group_id: i64,
    pub checkpoint_key: String,
    pub since: Option<DateTime<Utc>>,
    pub data_start_time: Option<DateTime<Utc>>,
    pub data_end_time: DateTime<Utc>,
    pub resource_types: Vec<String>,
    pub scope: FilterScope,
}

impl OrchestratorInput {
    pub fn validate(&self) -> Result<()> {
        TimeRange::new(self.data_start_time, self.data_end_time)?;
        if self.checkpoint_key.trim().is_empty() {
            return Err(IngestError::config("checkpoint key must not be empty"));
        }
        if self.scope == FilterScope::System && self.resource_types.is_empty() {
            return Err(IngestError::config("no resource types to extract"));
        }
        let mut seen = HashSet::new();
        if let Some(repeated) = self.resource_types.iter().find(|rt| !seen.insert(rt.as_str())) {
            return Err(IngestError::config(format!(
                "resource type '{}' is listed more than once",
                repeated
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Initializing,
    Dispatching,
    Draining,
    Completed,
    Cancelled,
    Failed,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::Initializing => "initializing",
            OrchestratorState::Dispatching => "dispatching",
            OrchestratorState::Draining => "draining",
            OrchestratorState::Completed => "completed",
            OrchestratorState::Cancelled => "cancelled",
            OrchestratorState::Failed => "failed",
        }
    }
}

/// Snapshot published after every checkpoint write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorProgress {
    pub state: OrchestratorState,
    pub created_job_count: i64,
    pub completed_job_count: i64,
    pub running_job_count: usize,
}

/// Final statistics of a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorOutcome {
    pub statistics: JobStatistics,
    pub created_job_count: i64,
    pub completed_job_count: i64,
    pub complete_time: DateTime<Utc>,
}

impl OrchestratorOutcome {
    fn from_checkpoint(checkpoint: &OrchestratorCheckpoint, complete_time: DateTime<Utc>) -> Self {
        Self {
            statistics: checkpoint.statistics.clone(),
            created_job_count: checkpoint.created_job_count,
            completed_job_count: checkpoint.completed_job_count,
            complete_time,
        }
    }
}

struct Run<'a> {
    input: &'a OrchestratorInput,
    cancel: &'a CancellationToken,
    writer: CheckpointWriter,
    state: OrchestratorState,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    splitter: JobSplitter,
    oracle: Arc<dyn ResourceCountOracle>,
    query_timeout: Duration,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn CheckpointStore>,
    commit: Arc<dyn CommitHook>,
    patients: Option<Arc<dyn PatientSource>>,
    progress: watch::Sender<OrchestratorProgress>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        split_config: SplitConfig,
        oracle: Arc<dyn ResourceCountOracle>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn CheckpointStore>,
        commit: Arc<dyn CommitHook>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| IngestError::config(e.to_string()))?;
        let query_timeout = split_config.count_timeout();
        let splitter = JobSplitter::new(oracle.clone(), split_config)?;
        let (progress, _) = watch::channel(OrchestratorProgress {
            state: OrchestratorState::Initializing,
            created_job_count: 0,
            completed_job_count: 0,
            running_job_count: 0,
        });

        Ok(Self {
            config,
            splitter,
            oracle,
            query_timeout,
            queue,
            store,
            commit,
            patients: None,
            progress,
        })
    }

    pub fn with_patient_source(mut self, source: Arc<dyn PatientSource>) -> Self {
        self.patients = Some(source);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorProgress> {
        self.progress.subscribe()
    }

    /// Run to completion, resuming from the checkpoint under
    /// `input.checkpoint_key` if one exists
    pub async fn run(
        &self,
        input: &OrchestratorInput,
        cancel: CancellationToken,
    ) -> Result<OrchestratorOutcome> {
        match self.run_to_completion(input, &cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let state = match e.kind() {
                    FailureKind::Cancelled => {
                        info!(checkpoint_key = %input.checkpoint_key, "Orchestrator cancelled");
                        OrchestratorState::Cancelled
                    },
                    kind => {
                        error!(
                            checkpoint_key = %input.checkpoint_key,
                            kind = kind.as_str(),
                            error = %e,
                            "Orchestrator failed"
                        );
                        OrchestratorState::Failed
                    },
                };
                self.progress.send_modify(|progress| progress.state = state);
                Err(e)
            },
        }
    }

    async fn run_to_completion(
        &self,
        input: &OrchestratorInput,
        cancel: &CancellationToken,
    ) -> Result<OrchestratorOutcome> {
        input.validate()?;
        let strategy = self.config.job_version.tracking();

        let writer = CheckpointWriter::load_or_create(
            self.store.clone(),
            input.checkpoint_key.clone(),
            OrchestratorCheckpoint::new(strategy, Utc::now()),
            self.config.checkpoint_write_retries,
        )
        .await?;

        let mut run = Run {
            input,
            cancel,
            writer,
            state: OrchestratorState::Initializing,
        };
        self.publish(&run);

        if run.writer.current().running_jobs.strategy() != strategy {
            return Err(IngestError::config(format!(
                "checkpoint '{}' tracks running jobs differently than job version {}",
                input.checkpoint_key, self.config.job_version
            )));
        }

        if let Some(complete_time) = run.writer.current().complete_time {
            info!(checkpoint_key = %input.checkpoint_key, "Run already completed");
            run.state = OrchestratorState::Completed;
            self.publish(&run);
            return Ok(OrchestratorOutcome::from_checkpoint(
                run.writer.current(),
                complete_time,
            ));
        }

        info!(
            checkpoint_key = %input.checkpoint_key,
            job_version = %self.config.job_version,
            created = run.writer.current().created_job_count,
            running = run.writer.current().running_count(),
            "Orchestrator starting"
        );

        if let Some(pending) = run.writer.current().submitting_job.clone() {
            info!(sequence_id = pending.sequence_id, "Resubmitting interrupted dispatch");
            self.wait_for_capacity(&mut run).await?;
            self.submit(&mut run, pending).await?;
        }

        run.state = OrchestratorState::Dispatching;
        self.publish(&run);
        match (&input.scope, self.config.job_version.split_mode()) {
            (FilterScope::System, SplitMode::Adaptive) => {
                self.dispatch_resource_types(&mut run).await?
            },
            (FilterScope::System, SplitMode::FixedTimespan { start_at_record }) => {
                self.dispatch_fixed_spans(&mut run, start_at_record).await?
            },
            (FilterScope::Group { group_id }, _) => self.dispatch_group(&mut run, group_id).await?,
        }

        run.state = OrchestratorState::Draining;
        self.publish(&run);
        self.drain(&mut run).await?;

        let complete_time = Utc::now();
        run.writer
            .apply(|cp| cp.with_complete_time(complete_time))
            .await?;
        run.state = OrchestratorState::Completed;
        self.publish(&run);

        let outcome = OrchestratorOutcome::from_checkpoint(run.writer.current(), complete_time);
        info!(
            checkpoint_key = %input.checkpoint_key,
            jobs = outcome.created_job_count,
            processed = outcome.statistics.processed_count_in_total,
            bytes = outcome.statistics.processed_data_size_in_total,
            "Orchestrator completed"
        );
        Ok(outcome)
    }

    async fn dispatch_resource_types(&self, run: &mut Run<'_>) -> Result<()> {
        let input = run.input;
        let end = input.data_end_time;
        let mut pool = CandidatePool::new(self.splitter.bounds().low);

        for resource_type in &input.resource_types {
            let start = run
                .writer
                .current()
                .submitted_until(resource_type)
                .or(input.data_start_time);
            if start.is_some_and(|s| s >= end) {
                debug!(resource_type = %resource_type, "Already fully dispatched");
                continue;
            }

            let mut cursor =
                self.splitter
                    .split(resource_type.clone(), start, end, run.cancel.clone())?;

            while let Some(sub_job) = cursor.next_sub_job().await? {
                ensure_not_cancelled(run.cancel)?;

                match pool.place(sub_job)? {
                    Placement::Ready(job) => {
                        let definition = self.definition(run, input.data_start_time, end);
                        self.dispatch(
                            run,
                            ProcessingJobInputData {
                                split_parameters: job.split_parameters,
                                ..definition
                            },
                        )
                        .await?;
                    },
                    Placement::Held => {},
                    Placement::Empty(sub_job) => {
                        let until = sub_job.range.end;
                        run.writer
                            .apply(|cp| cp.with_advanced(&sub_job.resource_type, until))
                            .await?;
                        self.publish(run);
                    },
                }
            }
            info!(resource_type = %resource_type, "Resource type split");
        }

        if let Some(job) = pool.flush_remaining() {
            let definition = self.definition(run, input.data_start_time, end);
            self.dispatch(
                run,
                ProcessingJobInputData {
                    split_parameters: job.split_parameters,
                    ..definition
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Consecutive fixed-length windows over all resource types, resumed
    /// from the checkpoint's `next_job_timestamp`
    async fn dispatch_fixed_spans(&self, run: &mut Run<'_>, start_at_record: bool) -> Result<()> {
        let input = run.input;
        let end = input.data_end_time;
        let interval = span_interval(
            input.data_start_time,
            end,
            self.config.initial_interval(),
            self.config.incremental_interval(),
        )?;
        let mut cursor = FixedSpanCursor::new(
            self.oracle.clone(),
            input.resource_types.clone(),
            interval,
            start_at_record,
            self.query_timeout,
            run.cancel.clone(),
            input.data_start_time,
            run.writer.current().next_job_timestamp,
            end,
        );
        info!(
            interval_secs = interval.num_seconds(),
            resume_at = ?run.writer.current().next_job_timestamp,
            "Dispatching fixed spans"
        );

        while let Some(span) = cursor.next_span().await? {
            ensure_not_cancelled(run.cancel)?;
            let definition = self.definition(run, span.start, span.end);
            self.dispatch(run, definition).await?;
        }

        if run.writer.current().next_job_timestamp.map_or(true, |at| at < end) {
            run.writer
                .apply(|cp| cp.with_next_job_timestamp(end))
                .await?;
            self.publish(run);
        }
        Ok(())
    }

    async fn dispatch_group(&self, run: &mut Run<'_>, group_id: &str) -> Result<()> {
        let source = self
            .patients
            .as_ref()
            .ok_or_else(|| IngestError::config("group scope needs a patient source"))?;
        let patients = source.list_patients(group_id).await?;
        let per_job = self.config.patients_per_job;

        let mut index = run.writer.current().next_patient_index;
        info!(group_id, patients = patients.len(), resume_at = index, "Dispatching group");

        while index < patients.len() {
            ensure_not_cancelled(run.cancel)?;
            let batch_end = (index + per_job).min(patients.len());
            let batch: Vec<PatientWrapper> = patients[index..batch_end].to_vec();
            let definition = self.definition(run, run.input.data_start_time, run.input.data_end_time);
            self.dispatch(
                run,
                ProcessingJobInputData {
                    to_be_processed_patients: Some(batch),
                    ..definition
                },
            )
            .await?;
            index = batch_end;
        }
        Ok(())
    }

    /// Definition of the next job over `[start, end)`, with no split
    /// parameters and no patients yet
    fn definition(
        &self,
        run: &Run<'_>,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> ProcessingJobInputData {
        ProcessingJobInputData {
            job_type: JobType::Processing,
            job_version: self.config.job_version,
            trigger_sequence_id: run.input.trigger_sequence_id,
            sequence_id: run.writer.current().created_job_count,
            since: run.input.since,
            data_start_time: start,
            data_end_time: end,
            split_parameters: BTreeMap::new(),
            to_be_processed_patients: None,
        }
    }

    /// Respect the cap, submit, then drain eagerly when many jobs are in
    /// flight
    async fn dispatch(&self, run: &mut Run<'_>, definition: ProcessingJobInputData) -> Result<()> {
        self.wait_for_capacity(run).await?;
        self.submit(run, definition).await?;

        if run.writer.current().running_count() > self.config.drain_threshold {
            self.check_running_jobs(run).await?;
        }
        Ok(())
    }

    /// Persist the marker, enqueue, then record the job as running
    async fn submit(&self, run: &mut Run<'_>, definition: ProcessingJobInputData) -> Result<()> {
        ensure_not_cancelled(run.cancel)?;
        let identity = job_identity(&definition)?;

        run.writer.apply(|cp| cp.with_submitting(&definition)).await?;

        let handles = self
            .queue
            .enqueue(
                run.input.queue_group_id,
                vec![QueuedJob {
                    identity,
                    definition: definition.clone(),
                }],
            )
            .await?;
        let job_id = handles
            .first()
            .map(|handle| handle.id)
            .ok_or_else(|| IngestError::Queue("enqueue returned no job".to_string()))?;

        run.writer
            .apply(|cp| cp.with_dispatched(&definition, job_id))
            .await?;

        info!(
            job_id,
            sequence_id = definition.sequence_id,
            resource_types = ?definition.split_parameters.keys().collect::<Vec<_>>(),
            patients = definition.patient_count(),
            running = run.writer.current().running_count(),
            "Dispatched processing job"
        );
        self.publish(run);
        Ok(())
    }

    async fn wait_for_capacity(&self, run: &mut Run<'_>) -> Result<()> {
        while run.writer.current().running_count() >= self.config.max_running_jobs {
            self.check_running_jobs(run).await?;
            if run.writer.current().running_count() >= self.config.max_running_jobs {
                debug!(
                    running = run.writer.current().running_count(),
                    max = self.config.max_running_jobs,
                    "At concurrency cap"
                );
                self.pause(run.cancel).await?;
            }
        }
        Ok(())
    }

    async fn drain(&self, run: &mut Run<'_>) -> Result<()> {
        loop {
            ensure_not_cancelled(run.cancel)?;
            self.check_running_jobs(run).await?;
            if run.writer.current().running_count() == 0 {
                return Ok(());
            }
            self.pause(run.cancel).await?;
        }
    }

    /// One completion check. Ordered tracking keeps going while the oldest
    /// job keeps turning out completed.
    async fn check_running_jobs(&self, run: &mut Run<'_>) -> Result<()> {
        loop {
            let ids = run.writer.current().running_jobs.ids_to_poll();
            if ids.is_empty() {
                return Ok(());
            }

            let jobs = self.queue.get_jobs_by_ids(&ids).await?;
            let mut completed_any = false;

            for job in &jobs {
                match job.status {
                    JobStatus::Completed => {
                        self.complete_job(run, job).await?;
                        completed_any = true;
                    },
                    JobStatus::Failed => {
                        return Err(IngestError::JobFailed {
                            job_id: job.id,
                            message: job.error.clone().unwrap_or_default(),
                        });
                    },
                    JobStatus::Cancelled => {
                        warn!(job_id = job.id, "Processing job was cancelled");
                        return Err(IngestError::Cancelled);
                    },
                    JobStatus::Created | JobStatus::Running => {},
                }
            }

            let strategy = run.writer.current().running_jobs.strategy();
            if !completed_any || strategy == TrackingStrategy::Unordered {
                return Ok(());
            }
        }
    }

    async fn complete_job(&self, run: &mut Run<'_>, job: &JobInfo) -> Result<()> {
        let result = job.parsed_result()?;
        self.commit.commit(job.id).await?;

        if let (Some(versions), Some(source)) = (&result.processed_patient_versions, &self.patients)
        {
            source.update_patient_versions(versions).await?;
        }

        let statistics = result.statistics;
        run.writer
            .apply(|cp| cp.with_completed(job.id, &statistics))
            .await?;

        info!(
            job_id = job.id,
            processed = statistics.processed_count_in_total,
            completed = run.writer.current().completed_job_count,
            running = run.writer.current().running_count(),
            "Processing job completed"
        );
        self.publish(run);
        Ok(())
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            _ = tokio::time::sleep(self.config.check_interval()) => Ok(()),
        }
    }

    fn publish(&self, run: &Run<'_>) {
        let checkpoint = run.writer.current();
        self.progress.send_replace(OrchestratorProgress {
            state: run.state,
            created_job_count: checkpoint.created_job_count,
            completed_job_count: checkpoint.completed_job_count,
            running_job_count: checkpoint.running_count(),
        });
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }
    Ok(())
}

/// Resource types still short of `end` according to `checkpoint`. Fixed-span
/// progress counts for every type.
pub fn pending_resource_types(
    checkpoint: &OrchestratorCheckpoint,
    resource_types: &[String],
    end: DateTime<Utc>,
) -> BTreeMap<String, Option<DateTime<Utc>>> {
    resource_types
        .iter()
        .filter_map(|rt| {
            let submitted = checkpoint
                .submitted_until(rt)
                .or(checkpoint.next_job_timestamp);
            match submitted {
                Some(ts) if ts >= end => None,
                _ => Some((rt.clone(), submitted)),
            }
        })
        .collect()
}
