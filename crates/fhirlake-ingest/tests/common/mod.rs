//! Shared fixtures for the integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use fhirlake_ingest::framework::queue::{JobInfo, JobQueue, MemoryJobQueue, QueuedJob};
use fhirlake_ingest::framework::types::{JobId, JobStatus, SubJobInfo, TimeRange};
use fhirlake_ingest::jobs::{JobStatistics, ProcessingJobResult};
use fhirlake_ingest::framework::oracle::ResourceCountOracle;
use fhirlake_ingest::{IngestError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

static TRACING: Once = Once::new();

/// Route library logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn ms(n: i64) -> TimeDelta {
    TimeDelta::milliseconds(n)
}

/// `n` records of `resource_type`, one every `step_ms` starting at `from`
pub fn evenly_spaced(from: DateTime<Utc>, n: i64, step_ms: i64) -> Vec<DateTime<Utc>> {
    (0..n).map(|i| from + ms(i * step_ms)).collect()
}

// ============================================================================
// Oracles
// ============================================================================

/// Exact oracle over an in-memory set of record timestamps
#[derive(Default)]
pub struct RecordOracle {
    records: HashMap<String, Vec<DateTime<Utc>>>,
    pub count_calls: AtomicUsize,
    pub edge_calls: AtomicUsize,
}

impl RecordOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, resource_type: &str, mut timestamps: Vec<DateTime<Utc>>) -> Self {
        timestamps.sort();
        self.records.insert(resource_type.to_string(), timestamps);
        self
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    /// Ground truth for `[start, end)`
    pub fn records_in(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> &[DateTime<Utc>] {
        let Some(all) = self.records.get(resource_type) else {
            return &[];
        };
        let from = start.map_or(0, |s| all.partition_point(|ts| *ts < s));
        let to = all.partition_point(|ts| *ts < end);
        if from >= to {
            &[]
        } else {
            &all[from..to]
        }
    }

    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.records.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn total(&self, resource_type: &str) -> i64 {
        self.records.get(resource_type).map_or(0, |r| r.len() as i64)
    }
}

#[async_trait]
impl ResourceCountOracle for RecordOracle {
    async fn count(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records_in(resource_type, start, end).len() as i64)
    }

    async fn first_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.edge_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records_in(resource_type, start, end).first().copied())
    }

    async fn last_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.edge_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records_in(resource_type, start, end).last().copied())
    }
}

/// Fails every count over an interval of one millisecond or less
pub struct GranularityBlindOracle {
    pub inner: Arc<RecordOracle>,
}

#[async_trait]
impl ResourceCountOracle for GranularityBlindOracle {
    async fn count(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        if let Some(start) = start {
            if end - start <= ms(1) {
                return Err(IngestError::Oracle("query too narrow".to_string()));
            }
        }
        self.inner.count(resource_type, start, end).await
    }

    async fn first_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.first_timestamp(resource_type, start, end).await
    }

    async fn last_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.last_timestamp(resource_type, start, end).await
    }
}

/// Misbehaves on `failures` count calls after the first `skip`, then
/// answers exactly
pub struct FlakyOracle {
    pub inner: Arc<RecordOracle>,
    /// Calls answered normally before the failures start
    skip: AtomicUsize,
    failures: AtomicUsize,
    /// Hang instead of erroring, to exercise the probe timeout
    hang_for: Option<Duration>,
}

impl FlakyOracle {
    pub fn failing(inner: Arc<RecordOracle>, failures: usize) -> Self {
        Self::failing_after(inner, 0, failures)
    }

    pub fn failing_after(inner: Arc<RecordOracle>, skip: usize, failures: usize) -> Self {
        Self {
            inner,
            skip: AtomicUsize::new(skip),
            failures: AtomicUsize::new(failures),
            hang_for: None,
        }
    }

    pub fn hanging(inner: Arc<RecordOracle>, failures: usize, hang_for: Duration) -> Self {
        Self {
            inner,
            skip: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
            hang_for: Some(hang_for),
        }
    }

    fn take_failure(&self) -> bool {
        if self
            .skip
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResourceCountOracle for FlakyOracle {
    async fn count(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        if self.take_failure() {
            match self.hang_for {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(IngestError::Oracle("connection reset".to_string())),
            }
        }
        self.inner.count(resource_type, start, end).await
    }

    async fn first_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.first_timestamp(resource_type, start, end).await
    }

    async fn last_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.last_timestamp(resource_type, start, end).await
    }
}

/// Cancels `token` once `after` count calls have been answered
pub struct CancellingOracle {
    pub inner: Arc<RecordOracle>,
    pub token: CancellationToken,
    pub after: usize,
    calls: AtomicUsize,
}

impl CancellingOracle {
    pub fn new(inner: Arc<RecordOracle>, token: CancellationToken, after: usize) -> Self {
        Self {
            inner,
            token,
            after,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResourceCountOracle for CancellingOracle {
    async fn count(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        let answered = self.inner.count(resource_type, start, end).await;
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.token.cancel();
        }
        answered
    }

    async fn first_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.first_timestamp(resource_type, start, end).await
    }

    async fn last_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.last_timestamp(resource_type, start, end).await
    }
}

// ============================================================================
// Sub-job checks
// ============================================================================

/// Sub-jobs tile `[start, end)` in order with no gap and no overlap
pub fn assert_tiles(sub_jobs: &[SubJobInfo], start: Option<DateTime<Utc>>, end: DateTime<Utc>) {
    assert!(!sub_jobs.is_empty(), "no sub-jobs");
    assert_eq!(sub_jobs[0].range.start, start, "first sub-job must start at the window start");
    for pair in sub_jobs.windows(2) {
        assert!(
            pair[0].range.is_followed_by(&pair[1].range),
            "gap or overlap between {} and {}",
            pair[0].range,
            pair[1].range
        );
    }
    assert_eq!(sub_jobs[sub_jobs.len() - 1].range.end, end, "last sub-job must end at the window end");
}

/// Every reported count matches the records actually in its range
pub fn assert_counts_exact(oracle: &RecordOracle, sub_jobs: &[SubJobInfo]) {
    for sub_job in sub_jobs {
        let actual = oracle
            .records_in(&sub_job.resource_type, sub_job.range.start, sub_job.range.end)
            .len() as i64;
        assert_eq!(sub_job.resource_count, actual, "count mismatch for {}", sub_job.range);
    }
}

// ============================================================================
// Queues
// ============================================================================

/// What a simulated worker does with a polled job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerBehaviour {
    Complete,
    FailSequence(i64),
    CancelSequence(i64),
}

/// Memory queue whose jobs finish on their own after a number of polls.
///
/// Results carry the exact record counts of each range when an oracle is
/// attached, and bump every patient's version by one.
pub struct SimulatedQueue {
    pub inner: MemoryJobQueue,
    oracle: Option<Arc<RecordOracle>>,
    polls_to_finish: usize,
    behaviour: WorkerBehaviour,
    polls: Mutex<HashMap<JobId, usize>>,
    max_active: AtomicUsize,
    enqueue_calls: AtomicUsize,
    /// Fail the enqueue call with this 1-based index; `stored` decides
    /// whether the job is persisted before the error surfaces
    enqueue_fault: StdMutex<Option<(usize, bool)>>,
}

impl SimulatedQueue {
    pub fn new() -> Self {
        Self {
            inner: MemoryJobQueue::new(),
            oracle: None,
            polls_to_finish: 1,
            behaviour: WorkerBehaviour::Complete,
            polls: Mutex::new(HashMap::new()),
            max_active: AtomicUsize::new(0),
            enqueue_calls: AtomicUsize::new(0),
            enqueue_fault: StdMutex::new(None),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<RecordOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_polls_to_finish(mut self, polls: usize) -> Self {
        self.polls_to_finish = polls.max(1);
        self
    }

    pub fn with_behaviour(mut self, behaviour: WorkerBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    /// Arm a one-shot enqueue failure
    pub fn fail_enqueue(&self, call: usize, stored: bool) {
        self.enqueue_calls.store(0, Ordering::SeqCst);
        *self.enqueue_fault.lock().unwrap() = Some((call, stored));
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.inner.jobs().await
    }

    fn result_for(&self, job: &JobInfo) -> ProcessingJobResult {
        let mut statistics = JobStatistics::default();
        let definition = &job.definition;
        // a fixed-span job reads every known type over its own window
        let ranges: BTreeMap<String, TimeRange> = if definition.is_fixed_span() {
            let window = TimeRange {
                start: definition.data_start_time,
                end: definition.data_end_time,
            };
            self.oracle
                .as_ref()
                .map(|oracle| oracle.resource_types())
                .unwrap_or_default()
                .into_iter()
                .map(|resource_type| (resource_type, window))
                .collect()
        } else {
            definition.split_parameters.clone()
        };
        for (resource_type, range) in &ranges {
            let processed = self.oracle.as_ref().map_or(0, |oracle| {
                oracle.records_in(resource_type, range.start, range.end).len() as i64
            });
            statistics.search_count.insert(resource_type.clone(), processed);
            statistics.processed_count.insert(resource_type.clone(), processed);
            statistics.processed_count_in_total += processed;
            statistics.processed_data_size_in_total += processed * 100;
        }

        let processed_patient_versions = job.definition.to_be_processed_patients.as_ref().map(|patients| {
            patients
                .iter()
                .map(|p| (p.patient_hash.clone(), p.version_id + 1))
                .collect::<BTreeMap<_, _>>()
        });

        ProcessingJobResult {
            statistics,
            processed_patient_versions,
        }
    }
}

#[async_trait]
impl JobQueue for SimulatedQueue {
    async fn enqueue(&self, group_id: i64, jobs: Vec<QueuedJob>) -> Result<Vec<JobInfo>> {
        let call = self.enqueue_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = {
            let mut armed = self.enqueue_fault.lock().unwrap();
            match *armed {
                Some((at, stored)) if at == call => {
                    *armed = None;
                    Some(stored)
                },
                _ => None,
            }
        };

        match fault {
            Some(false) => return Err(IngestError::Queue("queue unavailable".to_string())),
            Some(true) => {
                self.inner.enqueue(group_id, jobs).await?;
                return Err(IngestError::Queue("acknowledgement lost".to_string()));
            },
            None => {},
        }

        let handles = self.inner.enqueue(group_id, jobs).await?;
        let active = self.inner.active_count().await;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(handles)
    }

    async fn get_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<JobInfo>> {
        for job in self.inner.get_jobs_by_ids(ids).await? {
            if job.status.is_terminal() {
                continue;
            }
            let finished = {
                let mut polls = self.polls.lock().await;
                let seen = polls.entry(job.id).or_insert(0);
                *seen += 1;
                *seen >= self.polls_to_finish
            };
            if !finished {
                if job.status == JobStatus::Created {
                    self.inner.start(job.id).await?;
                }
                continue;
            }

            match self.behaviour {
                WorkerBehaviour::FailSequence(seq) if job.definition.sequence_id == seq => {
                    self.inner.fail(job.id, "resource bundle rejected").await?;
                },
                WorkerBehaviour::CancelSequence(seq) if job.definition.sequence_id == seq => {
                    self.inner.cancel(job.id).await?;
                },
                _ => {
                    let result = self.result_for(&job);
                    self.inner.complete(job.id, &result).await?;
                },
            }
        }
        self.inner.get_jobs_by_ids(ids).await
    }
}

/// Each resource type's jobs tile `[start, end)` exactly once
pub fn assert_jobs_tile(
    jobs: &[JobInfo],
    resource_types: &[&str],
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
) {
    for resource_type in resource_types {
        let mut ranges: Vec<TimeRange> = jobs
            .iter()
            .filter_map(|job| job.definition.split_parameters.get(*resource_type).copied())
            .collect();
        ranges.sort_by_key(|range| range.start);

        assert!(!ranges.is_empty(), "{} was never dispatched", resource_type);
        assert_eq!(ranges[0].start, start, "{} starts late", resource_type);
        for pair in ranges.windows(2) {
            assert!(
                pair[0].is_followed_by(&pair[1]),
                "{}: {} then {}",
                resource_type,
                pair[0],
                pair[1]
            );
        }
        assert_eq!(ranges[ranges.len() - 1].end, end, "{} ends early", resource_type);
    }
}
