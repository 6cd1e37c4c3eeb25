//! Resource count oracle
//!
//! The oracle answers "how many records of this type were last updated in
//! `[start, end)`". It is slow and may fail; [`CountProbe`] wraps it with a
//! per-call timeout and turns every failure into [`ResourceCount::Unknown`]
//! so one flaky query never aborts a split.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::types::ResourceCount;
use crate::error::{IngestError, Result};

#[async_trait]
pub trait ResourceCountOracle: Send + Sync {
    /// Number of records with timestamp in `[start, end)`
    async fn count(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<i64>;

    /// Timestamp of the earliest record in `[start, end)`
    async fn first_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Timestamp of the latest record in `[start, end)`
    async fn last_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Timeout and cancellation wrapper around an oracle
#[derive(Clone)]
pub struct CountProbe {
    oracle: Arc<dyn ResourceCountOracle>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CountProbe {
    pub fn new(
        oracle: Arc<dyn ResourceCountOracle>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            oracle,
            timeout,
            cancel,
        }
    }

    pub fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        Ok(())
    }

    /// Count probe. Errors and timeouts become `Unknown`; only cancellation
    /// is returned as an error.
    pub async fn count(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<ResourceCount> {
        let probed = self
            .guarded(self.oracle.count(resource_type, start, end))
            .await?;
        match probed {
            Some(Ok(n)) if n >= 0 => Ok(ResourceCount::Known(n)),
            Some(Ok(n)) => {
                warn!(resource_type, count = n, "Oracle returned a negative count");
                Ok(ResourceCount::Unknown)
            },
            Some(Err(e)) => {
                warn!(resource_type, error = %e, "Count query failed");
                Ok(ResourceCount::Unknown)
            },
            None => {
                warn!(
                    resource_type,
                    timeout_secs = self.timeout.as_secs(),
                    "Count query timed out"
                );
                Ok(ResourceCount::Unknown)
            },
        }
    }

    pub async fn first_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let probed = self
            .guarded(self.oracle.first_timestamp(resource_type, start, end))
            .await?;
        Ok(Self::timestamp_or_none(resource_type, "first", probed))
    }

    pub async fn last_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let probed = self
            .guarded(self.oracle.last_timestamp(resource_type, start, end))
            .await?;
        Ok(Self::timestamp_or_none(resource_type, "last", probed))
    }

    /// `Ok(None)` on timeout, `Err(Cancelled)` when the token fires first
    async fn guarded<T, F>(&self, fut: F) -> Result<Option<Result<T>>>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => Ok(res.ok()),
        }
    }

    fn timestamp_or_none(
        resource_type: &str,
        which: &str,
        probed: Option<Result<Option<DateTime<Utc>>>>,
    ) -> Option<DateTime<Utc>> {
        match probed {
            Some(Ok(ts)) => ts,
            Some(Err(e)) => {
                warn!(resource_type, which, error = %e, "Timestamp probe failed");
                None
            },
            None => {
                warn!(resource_type, which, "Timestamp probe timed out");
                None
            },
        }
    }
}
