//! Checkpoint store contract and an in-memory store
//!
//! Writes are optimistic: `try_update` only succeeds when the caller's
//! expected version matches, and bumps the version by one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::orchestrator::checkpoint::OrchestratorCheckpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedCheckpoint {
    pub checkpoint: OrchestratorCheckpoint,
    pub version: i64,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedCheckpoint>>;

    /// Insert at version 1. `false` if the key already exists.
    async fn try_add(&self, key: &str, checkpoint: &OrchestratorCheckpoint) -> Result<bool>;

    /// Replace when the stored version equals `expected_version`. `false`
    /// means a concurrent writer won.
    async fn try_update(
        &self,
        key: &str,
        checkpoint: &OrchestratorCheckpoint,
        expected_version: i64,
    ) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, VersionedCheckpoint>>,
    injected_conflicts: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` updates fail as if another writer got there first
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedCheckpoint>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn try_add(&self, key: &str, checkpoint: &OrchestratorCheckpoint) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            VersionedCheckpoint {
                checkpoint: checkpoint.clone(),
                version: 1,
            },
        );
        Ok(true)
    }

    async fn try_update(
        &self,
        key: &str,
        checkpoint: &OrchestratorCheckpoint,
        expected_version: i64,
    ) -> Result<bool> {
        if self.take_conflict() {
            return Ok(false);
        }

        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.version == expected_version => {
                entry.checkpoint = checkpoint.clone();
                entry.version += 1;
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}
