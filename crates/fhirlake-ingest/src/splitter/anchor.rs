//! Anchor list
//!
//! Sorted map from timestamp to the cumulative record count before that
//! timestamp, scoped to one split. Known counts are memoized: once recorded
//! they are never replaced, so revisiting an anchor never re-queries the
//! oracle and never changes the outcome. Unknown anchors stay in the list
//! and are re-probed when the search next needs them.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::framework::types::ResourceCount;

#[derive(Debug, Clone, Default)]
pub struct AnchorList {
    anchors: BTreeMap<DateTime<Utc>, ResourceCount>,
}

impl AnchorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` at `at` unless a known count is already there. Returns
    /// the count that is in the list afterwards.
    pub fn record(&mut self, at: DateTime<Utc>, count: ResourceCount) -> ResourceCount {
        let slot = self.anchors.entry(at).or_insert(count);
        if slot.is_unknown() {
            *slot = count;
        }
        *slot
    }

    pub fn get(&self, at: DateTime<Utc>) -> Option<ResourceCount> {
        self.anchors.get(&at).copied()
    }

    /// Known count at `at`, if any
    pub fn known(&self, at: DateTime<Utc>) -> Option<i64> {
        self.get(at).and_then(ResourceCount::value)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.anchors.keys().next_back().copied()
    }

    /// Anchor timestamps strictly after `after`, or all of them for `None`
    pub fn timestamps_after(&self, after: Option<DateTime<Utc>>) -> Vec<DateTime<Utc>> {
        let lower = match after {
            Some(ts) => Bound::Excluded(ts),
            None => Bound::Unbounded,
        };
        self.anchors
            .range((lower, Bound::Unbounded))
            .map(|(ts, _)| *ts)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}
