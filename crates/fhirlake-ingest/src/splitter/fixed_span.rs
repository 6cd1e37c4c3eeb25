//! Fixed-timespan windows
//!
//! Older job versions cut a system-scope run into consecutive windows of one
//! length over all resource types at once. Each window opens at the earliest
//! record of any type at or after the previous window's end, so stretches
//! without records never become jobs.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::framework::oracle::ResourceCountOracle;
use crate::framework::types::TimeRange;

/// Runs starting within this long of their end use the incremental interval
const INCREMENTAL_RUN_SPAN_MINUTES: i64 = 60;

/// Window length for a run over `[start, end)`
pub fn span_interval(
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    initial: Duration,
    incremental: Duration,
) -> Result<TimeDelta> {
    let short_run =
        start.is_some_and(|s| s + TimeDelta::minutes(INCREMENTAL_RUN_SPAN_MINUTES) >= end);
    let interval = if short_run { incremental } else { initial };
    TimeDelta::from_std(interval)
        .map_err(|e| IngestError::config(format!("interval {:?} out of range: {}", interval, e)))
}

/// Lazy producer of fixed-length windows over `[start, end)`
pub struct FixedSpanCursor {
    oracle: Arc<dyn ResourceCountOracle>,
    resource_types: Vec<String>,
    interval: TimeDelta,
    start_at_record: bool,
    timeout: Duration,
    cancel: CancellationToken,
    /// End of the last window handed out, or the run start
    next: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    exhausted: bool,
}

impl FixedSpanCursor {
    /// `resume_from` is the end of the last window already dispatched
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oracle: Arc<dyn ResourceCountOracle>,
        resource_types: Vec<String>,
        interval: TimeDelta,
        start_at_record: bool,
        timeout: Duration,
        cancel: CancellationToken,
        start: Option<DateTime<Utc>>,
        resume_from: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Self {
        let next = resume_from.or(start);
        Self {
            oracle,
            resource_types,
            interval,
            start_at_record,
            timeout,
            cancel,
            next,
            end,
            exhausted: next.is_some_and(|n| n >= end),
        }
    }

    /// Next window, or `None` once no record is left before the end
    pub async fn next_span(&mut self) -> Result<Option<TimeRange>> {
        if self.exhausted {
            return Ok(None);
        }
        let from = self.next;

        let Some(first_record) = self.earliest_record(from).await? else {
            debug!(from = ?from, end = %self.end, "No records left for fixed spans");
            self.exhausted = true;
            return Ok(None);
        };

        let span_end = (first_record + self.interval).min(self.end);
        let span_start = if self.start_at_record {
            Some(first_record)
        } else {
            from
        };
        let span = TimeRange::new(span_start, span_end)?;

        self.next = Some(span_end);
        self.exhausted = span_end >= self.end;
        Ok(Some(span))
    }

    /// Earliest record of any resource type in `[from, end)`. Failures and
    /// timeouts are errors here: skipping a record would lose data.
    async fn earliest_record(&self, from: Option<DateTime<Utc>>) -> Result<Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for resource_type in &self.resource_types {
            let query = self.oracle.first_timestamp(resource_type, from, self.end);
            let found = tokio::select! {
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                res = tokio::time::timeout(self.timeout, query) => res.map_err(|_| {
                    IngestError::Oracle(format!(
                        "{} first record query timed out after {}s",
                        resource_type,
                        self.timeout.as_secs()
                    ))
                })??,
            };
            if let Some(ts) = found {
                if earliest.map_or(true, |e| ts < e) {
                    earliest = Some(ts);
                }
            }
        }
        Ok(earliest)
    }
}
