// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use attic_storage::{ArchiveStore, StorageError};

use crate::layout;
use crate::types::{Checkpoint, TableId};

/// Persists in-flight run state every N completed batches and clears it
/// on clean termination. Only consulted on crash resume; the manifest
/// and watermark remain the source of truth for committed work.
pub struct CheckpointStore {
    store: Arc<ArchiveStore>,
    prefix: Option<String>,
    every_batches: u64,
}

impl CheckpointStore {
    pub fn new(store: Arc<ArchiveStore>, prefix: Option<String>, every_batches: u64) -> Self {
        Self {
            store,
            prefix,
            every_batches: every_batches.max(1),
        }
    }

    fn key(&self, table: &TableId) -> object_store::path::Path {
        layout::checkpoint_key(self.prefix.as_deref(), table)
    }

    pub fn should_save(&self, batch_ordinal: u64) -> bool {
        batch_ordinal > 0 && batch_ordinal % self.every_batches == 0
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(checkpoint).expect("checkpoint serializes");
        self.store
            .put(&self.key(&checkpoint.table), Bytes::from(body))
            .await?;
        debug!(table = %checkpoint.table, ordinal = checkpoint.batch_ordinal,
            "checkpoint saved");
        Ok(())
    }

    pub async fn load(&self, table: &TableId) -> Result<Option<Checkpoint>, StorageError> {
        match self.store.get(&self.key(table)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(checkpoint) => Ok(Some(checkpoint)),
                Err(e) => {
                    warn!(table = %table, error = %e, "unreadable checkpoint, ignoring");
                    Ok(None)
                }
            },
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn clear(&self, table: &TableId) -> Result<(), StorageError> {
        match self.store.delete(&self.key(table)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drops checkpoints older than `max_age_hours`. Stale in-flight
    /// state is useless once its multipart uploads have been aborted.
    pub async fn gc(&self, table: &TableId, max_age_hours: i64) -> Result<bool, StorageError> {
        if let Some(checkpoint) = self.load(table).await? {
            if checkpoint.saved_at < Utc::now() - Duration::hours(max_age_hours) {
                info!(table = %table, saved_at = %checkpoint.saved_at,
                    "garbage-collecting stale checkpoint");
                self.clear(table).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Watermark;
    use object_store::memory::InMemory;

    fn store(every: u64) -> CheckpointStore {
        CheckpointStore::new(
            Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new()))),
            Some("archive".to_string()),
            every,
        )
    }

    fn table() -> TableId {
        TableId::new("orders", "public", "audit_logs")
    }

    fn checkpoint(ordinal: u64) -> Checkpoint {
        Checkpoint {
            table: table(),
            run_id: "run-1".to_string(),
            batch_ordinal: ordinal,
            watermark: Watermark::initial(&table()),
            completed_fingerprints: vec!["fp-0".to_string()],
            in_flight_started_at: None,
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn cadence_follows_configuration() {
        let cs = store(10);
        assert!(!cs.should_save(0));
        assert!(!cs.should_save(9));
        assert!(cs.should_save(10));
        assert!(cs.should_save(20));
    }

    #[tokio::test]
    async fn save_load_clear_cycle() {
        let cs = store(10);
        assert!(cs.load(&table()).await.unwrap().is_none());
        cs.save(&checkpoint(10)).await.unwrap();
        let loaded = cs.load(&table()).await.unwrap().unwrap();
        assert_eq!(loaded.batch_ordinal, 10);
        assert_eq!(loaded.completed_fingerprints, vec!["fp-0"]);
        cs.clear(&table()).await.unwrap();
        assert!(cs.load(&table()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gc_removes_only_stale_checkpoints() {
        let cs = store(10);
        let mut old = checkpoint(10);
        old.saved_at = Utc::now() - Duration::hours(100);
        cs.save(&old).await.unwrap();
        assert!(cs.gc(&table(), 48).await.unwrap());
        assert!(cs.load(&table()).await.unwrap().is_none());

        cs.save(&checkpoint(20)).await.unwrap();
        assert!(!cs.gc(&table(), 48).await.unwrap());
        assert!(cs.load(&table()).await.unwrap().is_some());
    }
}
