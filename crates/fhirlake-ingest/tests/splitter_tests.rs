//! Job splitter behaviour against in-memory count oracles
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use fhirlake_ingest::config::SplitConfig;
use fhirlake_ingest::framework::oracle::ResourceCountOracle;
use fhirlake_ingest::splitter::JobSplitter;
use fhirlake_ingest::{FailureKind, IngestError};
use futures::TryStreamExt;
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TEN_DAYS_MS: i64 = 10 * 24 * 60 * 60 * 1000;

fn splitter(oracle: Arc<dyn ResourceCountOracle>, low: i64, high: i64) -> JobSplitter {
    JobSplitter::new(oracle, SplitConfig::new(low, high)).unwrap()
}

/// 2500 records evenly spread over ten days
fn uniform_oracle() -> Arc<RecordOracle> {
    Arc::new(RecordOracle::new().with_records("Observation", evenly_spaced(t0(), 2500, 345_600)))
}

#[tokio::test]
async fn test_uniform_window_splits_into_even_quarters() {
    init_tracing();
    let oracle = uniform_oracle();
    let end = t0() + ms(TEN_DAYS_MS);

    let sub_jobs = splitter(oracle.clone(), 100, 1000)
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_tiles(&sub_jobs, Some(t0()), end);
    assert_counts_exact(&oracle, &sub_jobs);
    let counts: Vec<i64> = sub_jobs.iter().map(|s| s.resource_count).collect();
    assert_eq!(counts, vec![625, 625, 625, 625]);
}

#[tokio::test]
async fn test_anchors_are_never_probed_twice() {
    let oracle = uniform_oracle();
    let end = t0() + ms(TEN_DAYS_MS);

    splitter(oracle.clone(), 100, 1000)
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    // one total plus three bisection midpoints; later cuts reuse anchors
    assert_eq!(oracle.count_calls(), 4);
    assert_eq!(oracle.edge_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_split_is_deterministic() {
    let oracle = uniform_oracle();
    let end = t0() + ms(TEN_DAYS_MS);
    let splitter = splitter(oracle, 100, 1000);

    let first = splitter
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let second = splitter
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_empty_window_yields_one_empty_sub_job() {
    let oracle = Arc::new(RecordOracle::new());
    let end = t0() + ms(1000);

    let sub_jobs = splitter(oracle.clone(), 10, 100)
        .split("Patient", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(sub_jobs.len(), 1);
    assert_eq!(sub_jobs[0].resource_count, 0);
    assert_tiles(&sub_jobs, Some(t0()), end);
    assert_eq!(oracle.count_calls(), 1);
}

#[tokio::test]
async fn test_small_window_is_not_split() {
    let oracle = Arc::new(RecordOracle::new().with_records("Patient", evenly_spaced(t0(), 500, 10)));
    let end = t0() + ms(10_000);

    let sub_jobs = splitter(oracle.clone(), 100, 1000)
        .split("Patient", None, end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(sub_jobs.len(), 1);
    assert_eq!(sub_jobs[0].resource_count, 500);
    assert_eq!(sub_jobs[0].range.start, None);
    assert_eq!(oracle.edge_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_high_bound_inclusivity_is_configurable() {
    let oracle = Arc::new(RecordOracle::new().with_records("Patient", evenly_spaced(t0(), 1000, 10)));
    let end = t0() + ms(10_000);

    let inclusive = splitter(oracle.clone(), 100, 1000)
        .split("Patient", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(inclusive.len(), 1);

    let config = SplitConfig {
        inclusive_high_bound: false,
        ..SplitConfig::new(100, 1000)
    };
    let exclusive = JobSplitter::new(oracle.clone(), config)
        .unwrap()
        .split("Patient", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert!(exclusive.len() > 1);
    assert_tiles(&exclusive, Some(t0()), end);
    assert!(exclusive.iter().all(|s| s.resource_count < 1000));
}

#[tokio::test]
async fn test_open_start_uses_first_record_as_floor() {
    let oracle = Arc::new(
        RecordOracle::new().with_records("Encounter", evenly_spaced(t0() + ms(50_000), 300, 100)),
    );
    let end = t0() + ms(200_000);

    let sub_jobs = splitter(oracle.clone(), 50, 100)
        .split("Encounter", None, end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_tiles(&sub_jobs, None, end);
    assert_counts_exact(&oracle, &sub_jobs);
    assert!(sub_jobs.iter().all(|s| s.resource_count <= 100));
    assert_eq!(sub_jobs.iter().map(|s| s.resource_count).sum::<i64>(), 300);
}

#[tokio::test]
async fn test_unanswerable_millisecond_fails_as_backend_unhealthy() {
    init_tracing();
    let at = t0() + ms(10);
    let mut records = vec![at; 600];
    records.extend(vec![at + ms(1); 600]);
    let exact = Arc::new(RecordOracle::new().with_records("Observation", records));
    let oracle = Arc::new(GranularityBlindOracle { inner: exact });

    let result = splitter(oracle, 100, 1000)
        .split("Observation", Some(t0()), t0() + ms(20), CancellationToken::new())
        .unwrap()
        .collect_all()
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, IngestError::BackendUnhealthy { .. }), "{}", err);
    assert_eq!(err.kind(), FailureKind::Retriable);
}

#[tokio::test]
async fn test_same_data_splits_at_the_millisecond_when_answerable() {
    let at = t0() + ms(10);
    let mut records = vec![at; 600];
    records.extend(vec![at + ms(1); 600]);
    let oracle = Arc::new(RecordOracle::new().with_records("Observation", records));
    let end = t0() + ms(20);

    let sub_jobs = splitter(oracle.clone(), 100, 1000)
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(sub_jobs.len(), 2);
    assert_eq!(sub_jobs[0].range.end, at + ms(1));
    assert_eq!(sub_jobs[0].resource_count, 600);
    assert_eq!(sub_jobs[1].resource_count, 600);
    assert_tiles(&sub_jobs, Some(t0()), end);
}

#[tokio::test]
async fn test_total_count_is_retried() {
    let exact = uniform_oracle();
    let oracle = Arc::new(FlakyOracle::failing(exact.clone(), 2));
    let end = t0() + ms(TEN_DAYS_MS);

    let sub_jobs = splitter(oracle, 100, 1000)
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_tiles(&sub_jobs, Some(t0()), end);
    assert_counts_exact(&exact, &sub_jobs);
}

#[tokio::test]
async fn test_total_count_gives_up_after_configured_attempts() {
    let exact = uniform_oracle();
    let oracle = Arc::new(FlakyOracle::failing(exact.clone(), usize::MAX));

    let err = splitter(oracle, 100, 1000)
        .split("Observation", Some(t0()), t0() + ms(TEN_DAYS_MS), CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::BackendUnhealthy { .. }));
    // failures short-circuit before reaching the exact oracle
    assert_eq!(exact.count_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_probe_is_treated_as_unknown() {
    let exact = uniform_oracle();
    let oracle = Arc::new(FlakyOracle::hanging(exact.clone(), 1, Duration::from_secs(600)));
    let config = SplitConfig {
        count_timeout_secs: 5,
        ..SplitConfig::new(100, 1000)
    };
    let end = t0() + ms(TEN_DAYS_MS);

    let sub_jobs = JobSplitter::new(oracle, config)
        .unwrap()
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_tiles(&sub_jobs, Some(t0()), end);
    assert_counts_exact(&exact, &sub_jobs);
}

#[tokio::test]
async fn test_failed_bisection_probes_still_tile_the_window() {
    let exact = uniform_oracle();
    // the total succeeds, the first two bisection probes fail
    let oracle = Arc::new(FlakyOracle::failing_after(exact.clone(), 1, 2));
    let end = t0() + ms(TEN_DAYS_MS);

    let sub_jobs = splitter(oracle, 100, 1000)
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_tiles(&sub_jobs, Some(t0()), end);
    assert_counts_exact(&exact, &sub_jobs);
    assert!(sub_jobs.iter().all(|s| s.resource_count <= 1000));
}

#[tokio::test]
async fn test_stream_yields_the_same_sub_jobs() {
    let oracle = uniform_oracle();
    let end = t0() + ms(TEN_DAYS_MS);
    let splitter = splitter(oracle, 100, 1000);

    let collected = splitter
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let streamed: Vec<_> = splitter
        .split("Observation", Some(t0()), end, CancellationToken::new())
        .unwrap()
        .into_stream()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(collected, streamed);
}

#[tokio::test]
async fn test_cancelled_token_stops_the_split() {
    let token = CancellationToken::new();
    let oracle = Arc::new(CancellingOracle::new(uniform_oracle(), token.clone(), 2));

    let err = splitter(oracle, 100, 1000)
        .split("Observation", Some(t0()), t0() + ms(TEN_DAYS_MS), token)
        .unwrap()
        .collect_all()
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Cancelled));
    assert_eq!(err.kind(), FailureKind::Cancelled);
}

#[tokio::test]
async fn test_inverted_window_is_rejected() {
    let result = splitter(uniform_oracle(), 100, 1000).split(
        "Observation",
        Some(t0() + ms(10)),
        t0(),
        CancellationToken::new(),
    );
    assert!(matches!(result, Err(IngestError::InvalidRange(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sub_jobs_tile_and_respect_bounds(
        offsets in prop::collection::btree_set(0i64..100_000, 0..600),
        low in 1i64..50,
        spread in 1i64..200,
        open_start in any::<bool>(),
    ) {
        let high = low + spread;
        let records: Vec<_> = offsets.iter().map(|o| t0() + ms(*o)).collect();
        let total = records.len() as i64;
        let oracle = Arc::new(RecordOracle::new().with_records("Observation", records));
        let start = if open_start { None } else { Some(t0()) };
        let end = t0() + ms(100_000);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let sub_jobs = runtime.block_on(
            splitter(oracle.clone(), low, high)
                .split("Observation", start, end, CancellationToken::new())
                .unwrap()
                .collect_all(),
        ).unwrap();

        assert_tiles(&sub_jobs, start, end);
        assert_counts_exact(&oracle, &sub_jobs);
        prop_assert_eq!(sub_jobs.iter().map(|s| s.resource_count).sum::<i64>(), total);
        prop_assert!(sub_jobs.iter().all(|s| s.resource_count <= high));
        if let Some((_, rest)) = sub_jobs.split_last() {
            prop_assert!(rest.iter().all(|s| s.resource_count >= low));
        }
    }
}
