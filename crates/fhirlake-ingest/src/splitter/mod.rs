//! Adaptive job splitter
//!
//! [`JobSplitter::split`] returns a [`SplitCursor`], a lazy producer of
//! [`SubJobInfo`]s covering `[start, end)` in time order with no gaps and no
//! overlaps. Each call to [`SplitCursor::next_sub_job`] does just enough
//! oracle work to find the next cut:
//!
//! 1. The first call counts the whole range. Zero yields one empty sub-job,
//!    a count within the high bound yields the whole range.
//! 2. Otherwise an [`AnchorList`] is seeded with a zero-count floor (the
//!    start, or the first record), the first record, and the last record
//!    plus one millisecond at the total count.
//! 3. From the previous cut, anchors are walked until one exceeds the high
//!    bound relative to the cut. If the anchor before it already reaches the
//!    low bound, the cut goes there. Otherwise the gap between the two is
//!    bisected, probing `[lo, mid)` until the midpoint lands inside the
//!    bounds or the interval collapses to one millisecond.
//! 4. The cut at the last anchor is snapped to `end`.
//!
//! Unknown counts compare above every bound, which always shrinks the
//! search. An interval that is still unknown at one millisecond means the
//! counting backend is unhealthy and the split fails.

pub mod anchor;
pub mod candidate_pool;
pub mod fixed_span;

use chrono::{DateTime, TimeDelta, Utc};
use fhirlake_common::time::{format_instant, granularity, span_millis, MIN_GRANULARITY_MS};
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use anchor::AnchorList;
pub use candidate_pool::{CandidatePool, Placement, SplitProcessingJob};
pub use fixed_span::{span_interval, FixedSpanCursor};

use crate::config::SplitConfig;
use crate::error::{IngestError, Result};
use crate::framework::oracle::{CountProbe, ResourceCountOracle};
use crate::framework::types::{ResourceCount, SubJobInfo, TimeRange};

/// Low/high record-count bounds with the configured inclusivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitBounds {
    pub low: i64,
    pub high: i64,
    pub inclusive_high: bool,
}

impl SplitBounds {
    pub fn from_config(config: &SplitConfig) -> Self {
        Self {
            low: config.low_bound,
            high: config.high_bound,
            inclusive_high: config.inclusive_high_bound,
        }
    }

    /// Known and not above the high bound
    pub fn fits(&self, count: ResourceCount) -> bool {
        match count {
            ResourceCount::Known(n) if self.inclusive_high => n <= self.high,
            ResourceCount::Known(n) => n < self.high,
            ResourceCount::Unknown => false,
        }
    }

    pub fn below_low(&self, count: ResourceCount) -> bool {
        matches!(count, ResourceCount::Known(n) if n < self.low)
    }
}

pub struct JobSplitter {
    oracle: Arc<dyn ResourceCountOracle>,
    config: SplitConfig,
}

impl JobSplitter {
    pub fn new(oracle: Arc<dyn ResourceCountOracle>, config: SplitConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| IngestError::config(e.to_string()))?;
        Ok(Self { oracle, config })
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    pub fn bounds(&self) -> SplitBounds {
        SplitBounds::from_config(&self.config)
    }

    /// Lazily split `[start, end)` for one resource type
    pub fn split(
        &self,
        resource_type: impl Into<String>,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<SplitCursor> {
        let range = TimeRange::new(start, end)?;
        Ok(SplitCursor {
            probe: CountProbe::new(self.oracle.clone(), self.config.count_timeout(), cancel),
            bounds: self.bounds(),
            total_attempts: self.config.count_retry_attempts.max(1),
            resource_type: resource_type.into(),
            range,
            state: CursorState::Pending,
        })
    }
}

enum CursorState {
    Pending,
    Splitting(SplitState),
    Finished,
}

struct SplitState {
    anchors: AnchorList,
    /// Start of the next sub-job
    last_cut: Option<DateTime<Utc>>,
    /// Cumulative count at `last_cut`
    base: i64,
}

/// Lazy sequence of sub-jobs for one resource type
pub struct SplitCursor {
    probe: CountProbe,
    bounds: SplitBounds,
    total_attempts: u32,
    resource_type: String,
    range: TimeRange,
    state: CursorState,
}

impl SplitCursor {
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Next sub-job, or `None` once `end` has been reached
    pub async fn next_sub_job(&mut self) -> Result<Option<SubJobInfo>> {
        self.probe.ensure_not_cancelled()?;
        match std::mem::replace(&mut self.state, CursorState::Finished) {
            CursorState::Finished => Ok(None),
            CursorState::Pending => self.begin().await,
            CursorState::Splitting(state) => self.advance(state).await.map(Some),
        }
    }

    /// Drain the cursor
    pub async fn collect_all(mut self) -> Result<Vec<SubJobInfo>> {
        let mut sub_jobs = Vec::new();
        while let Some(sub_job) = self.next_sub_job().await? {
            sub_jobs.push(sub_job);
        }
        Ok(sub_jobs)
    }

    /// The cursor as a `Stream`; ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<SubJobInfo>> {
        stream::try_unfold(self, |mut cursor| async move {
            let next = cursor.next_sub_job().await?;
            Ok::<_, IngestError>(next.map(|sub_job| (sub_job, cursor)))
        })
    }

    async fn begin(&mut self) -> Result<Option<SubJobInfo>> {
        let total = self.total_count().await?;

        if total == 0 || self.bounds.fits(ResourceCount::Known(total)) {
            info!(
                resource_type = %self.resource_type,
                range = %self.range,
                total,
                "Range needs no splitting"
            );
            return Ok(Some(self.sub_job(self.range.start, self.range.end, total)));
        }

        let anchors = self.initial_anchors(total).await?;
        info!(
            resource_type = %self.resource_type,
            range = %self.range,
            total,
            anchors = anchors.len(),
            "Splitting range"
        );

        let state = SplitState {
            anchors,
            last_cut: self.range.start,
            base: 0,
        };
        self.advance(state).await.map(Some)
    }

    async fn total_count(&self) -> Result<i64> {
        for attempt in 1..=self.total_attempts {
            let count = self
                .probe
                .count(&self.resource_type, self.range.start, self.range.end)
                .await?;
            if let ResourceCount::Known(total) = count {
                return Ok(total);
            }
            warn!(
                resource_type = %self.resource_type,
                attempt,
                max_attempts = self.total_attempts,
                "Total count unknown"
            );
        }

        error!(resource_type = %self.resource_type, range = %self.range, "Total count never answered");
        Err(IngestError::BackendUnhealthy {
            resource_type: self.resource_type.clone(),
            at: self.range.end,
            detail: format!(
                "total count for {} unknown after {} attempts",
                self.range, self.total_attempts
            ),
        })
    }

    async fn initial_anchors(&self, total: i64) -> Result<AnchorList> {
        let rt = &self.resource_type;
        let (start, end) = (self.range.start, self.range.end);

        let first = self.probe.first_timestamp(rt, start, end).await?;
        let last = self.probe.last_timestamp(rt, start, end).await?;

        let mut anchors = AnchorList::new();
        let floor = start.or(first).unwrap_or(DateTime::UNIX_EPOCH);
        anchors.record(floor, ResourceCount::Known(0));
        if let Some(first) = first.filter(|ts| *ts > floor) {
            anchors.record(first, ResourceCount::Known(0));
        }

        let ceiling = last
            .map(|ts| ts + granularity())
            .filter(|ts| *ts > floor && *ts <= end)
            .unwrap_or(end);
        anchors.record(ceiling, ResourceCount::Known(total));

        Ok(anchors)
    }

    async fn advance(&mut self, mut state: SplitState) -> Result<SubJobInfo> {
        let cut = self.next_cut(&mut state).await?;
        let cumulative = state.anchors.known(cut).ok_or_else(|| {
            IngestError::internal(format!("cut {} has no known count", format_instant(&cut)))
        })?;
        let count = cumulative - state.base;

        let is_last = state.anchors.last_timestamp().map_or(true, |last| cut >= last);
        let end = if is_last { self.range.end } else { cut };

        debug!(
            resource_type = %self.resource_type,
            cut = %format_instant(&end),
            count,
            "Emitting sub-job"
        );
        let sub_job = self.sub_job(state.last_cut, end, count);

        if !is_last {
            state.last_cut = Some(cut);
            state.base = cumulative;
            self.state = CursorState::Splitting(state);
        }
        Ok(sub_job)
    }

    /// Find the next cut strictly after `state.last_cut`
    async fn next_cut(&self, state: &mut SplitState) -> Result<DateTime<Utc>> {
        let base = state.base;
        // last anchor whose relative count is within the high bound
        let mut previous: Option<(DateTime<Utc>, i64)> = None;

        for ts in state.anchors.timestamps_after(state.last_cut) {
            self.probe.ensure_not_cancelled()?;

            let cumulative = match state.anchors.get(ts) {
                Some(count @ ResourceCount::Known(_)) => count,
                _ => {
                    let (from, from_count) = match previous {
                        Some((p, c)) => (Some(p), c),
                        None => (state.last_cut, base),
                    };
                    let probed = self.probe.count(&self.resource_type, from, ts).await?;
                    state.anchors.record(ts, probed.offset(from_count))
                },
            };

            let relative = cumulative.relative_to(base);
            if self.bounds.fits(relative) {
                if let ResourceCount::Known(n) = cumulative {
                    previous = Some((ts, n));
                }
                continue;
            }

            if let Some((p, c)) = previous {
                if c - base >= self.bounds.low {
                    return Ok(p);
                }
            }

            let (lo, lo_count) = match (previous, state.last_cut) {
                (Some(p), _) => p,
                (None, Some(cut)) => (cut, base),
                (None, None) => {
                    return Err(IngestError::internal(
                        "anchor list has no floor before the first cut",
                    ))
                },
            };
            return self.bisect(state, lo, lo_count, ts).await;
        }

        state
            .anchors
            .last_timestamp()
            .ok_or_else(|| IngestError::internal("anchor list is empty"))
    }

    /// Binary search `(lo, hi]` for a cut whose relative count is in bounds
    async fn bisect(
        &self,
        state: &mut SplitState,
        mut lo: DateTime<Utc>,
        mut lo_count: i64,
        mut hi: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let base = state.base;

        loop {
            self.probe.ensure_not_cancelled()?;

            let span = span_millis(&lo, &hi);
            if span <= MIN_GRANULARITY_MS {
                return self.settle_collapsed(state, lo, lo_count, hi).await;
            }

            let mid = lo + TimeDelta::milliseconds(span / 2);
            let cumulative = match state.anchors.get(mid) {
                Some(count @ ResourceCount::Known(_)) => count,
                _ => {
                    let probed = self.probe.count(&self.resource_type, Some(lo), mid).await?;
                    state.anchors.record(mid, probed.offset(lo_count))
                },
            };

            let relative = cumulative.relative_to(base);
            if !self.bounds.fits(relative) {
                hi = mid;
            } else if self.bounds.below_low(relative) {
                lo = mid;
                lo_count = cumulative.value().unwrap_or(lo_count);
            } else {
                return Ok(mid);
            }
        }
    }

    /// One millisecond left: the cut must be `hi`, and its count must be known
    async fn settle_collapsed(
        &self,
        state: &mut SplitState,
        lo: DateTime<Utc>,
        lo_count: i64,
        hi: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        if state.anchors.known(hi).is_some() {
            return Ok(hi);
        }

        let probed = self.probe.count(&self.resource_type, Some(lo), hi).await?;
        if let ResourceCount::Known(_) = state.anchors.record(hi, probed.offset(lo_count)) {
            return Ok(hi);
        }

        error!(
            resource_type = %self.resource_type,
            at = %format_instant(&hi),
            "Count still unknown at minimum granularity"
        );
        Err(IngestError::BackendUnhealthy {
            resource_type: self.resource_type.clone(),
            at: hi,
            detail: format!(
                "count for [{}, {}) unknown at minimum granularity",
                format_instant(&lo),
                format_instant(&hi)
            ),
        })
    }

    fn sub_job(&self, start: Option<DateTime<Utc>>, end: DateTime<Utc>, count: i64) -> SubJobInfo {
        SubJobInfo {
            resource_type: self.resource_type.clone(),
            range: TimeRange { start, end },
            resource_count: count,
        }
    }
}
