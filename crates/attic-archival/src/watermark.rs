// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use attic_storage::{ArchiveStore, StorageError};

use crate::layout;
use crate::types::{TableId, Watermark};

/// Durable `(last_ts, last_pk)` cursor per table, stored at the
/// well-known watermark key and integrity-checked by content hash on
/// load. Updated only after a batch transaction commits.
pub struct WatermarkStore {
    store: Arc<ArchiveStore>,
    prefix: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("watermark for {table} failed its integrity check")]
    IntegrityFailure { table: TableId },
    #[error("watermark for {table} would move backwards")]
    BackwardsMove { table: TableId },
    #[error("watermark for {table} is not valid JSON: {source}")]
    Corrupt {
        table: TableId,
        source: serde_json::Error,
    },
}

impl WatermarkStore {
    pub fn new(store: Arc<ArchiveStore>, prefix: Option<String>) -> Self {
        Self { store, prefix }
    }

    fn key(&self, table: &TableId) -> object_store::path::Path {
        layout::watermark_key(self.prefix.as_deref(), table)
    }

    /// Loads the watermark, or the initial one when none exists yet. A
    /// hash mismatch is an integrity failure, not a silent reset.
    pub async fn load(&self, table: &TableId) -> Result<Watermark, WatermarkError> {
        let key = self.key(table);
        let bytes = match self.store.get(&key).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                debug!(table = %table, "no watermark yet, starting from the beginning");
                return Ok(Watermark::initial(table));
            }
            Err(e) => return Err(e.into()),
        };
        let watermark: Watermark =
            serde_json::from_slice(&bytes).map_err(|source| WatermarkError::Corrupt {
                table: table.clone(),
                source,
            })?;
        if watermark.content_sha256 != watermark.compute_hash() {
            warn!(table = %table, "watermark content hash mismatch");
            return Err(WatermarkError::IntegrityFailure {
                table: table.clone(),
            });
        }
        Ok(watermark)
    }

    /// Persists an already-advanced watermark by conditional write:
    /// the stored object must still be the version the monotonicity
    /// check ran against. The per-table lock makes conflicts
    /// exceptional, not routine.
    pub async fn save(&self, table: &TableId, watermark: &Watermark) -> Result<(), WatermarkError> {
        let key = self.key(table);
        let version = match self.store.get_with_version(&key).await {
            Ok((bytes, version)) => {
                let current: Watermark =
                    serde_json::from_slice(&bytes).map_err(|source| WatermarkError::Corrupt {
                        table: table.clone(),
                        source,
                    })?;
                if let (Some((cur_ts, cur_pk)), Some((new_ts, new_pk))) =
                    (current.cursor(), watermark.cursor())
                {
                    if (new_ts, new_pk) < (cur_ts, cur_pk) {
                        return Err(WatermarkError::BackwardsMove {
                            table: table.clone(),
                        });
                    }
                }
                Some(version)
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let body = Bytes::from(serde_json::to_vec_pretty(watermark).expect("watermark serializes"));
        match version {
            Some(version) => self.store.put_if_matches(&key, body, version).await?,
            None => {
                self.store.put(&key, body).await?;
            }
        }
        debug!(table = %table, rows = watermark.cumulative_rows, "watermark advanced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attic_codec::PkValue;
    use chrono::{TimeZone, Utc};
    use object_store::memory::InMemory;

    fn store() -> WatermarkStore {
        WatermarkStore::new(
            Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new()))),
            Some("archive".to_string()),
        )
    }

    fn table() -> TableId {
        TableId::new("orders", "public", "audit_logs")
    }

    fn ts(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_watermark_starts_initial() {
        let wm = store().load(&table()).await.unwrap();
        assert!(wm.cursor().is_none());
        assert_eq!(wm.cumulative_rows, 0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let ws = store();
        let advanced = Watermark::initial(&table())
            .advanced(ts(100), PkValue::Int(250), 250)
            .unwrap();
        ws.save(&table(), &advanced).await.unwrap();
        let loaded = ws.load(&table()).await.unwrap();
        assert_eq!(loaded.cursor(), advanced.cursor());
        assert_eq!(loaded.cumulative_rows, 250);
    }

    #[tokio::test]
    async fn backwards_moves_are_rejected() {
        let ws = store();
        let far = Watermark::initial(&table())
            .advanced(ts(100), PkValue::Int(1000), 1000)
            .unwrap();
        ws.save(&table(), &far).await.unwrap();

        let mut behind = Watermark::initial(&table());
        behind.last_ts = Some(ts(50));
        behind.last_pk = Some(PkValue::Int(1));
        behind.content_sha256 = behind.compute_hash();
        let err = ws.save(&table(), &behind).await.unwrap_err();
        assert!(matches!(err, WatermarkError::BackwardsMove { .. }));
    }

    #[tokio::test]
    async fn tampered_watermark_fails_integrity() {
        let raw_store = Arc::new(InMemory::new());
        let client = Arc::new(ArchiveStore::for_tests(raw_store));
        let ws = WatermarkStore::new(client.clone(), None);
        let advanced = Watermark::initial(&table())
            .advanced(ts(10), PkValue::Int(7), 7)
            .unwrap();
        ws.save(&table(), &advanced).await.unwrap();

        // Flip a field without recomputing the hash.
        let key = layout::watermark_key(None, &table());
        let mut parsed: serde_json::Value =
            serde_json::from_slice(&client.get(&key).await.unwrap()).unwrap();
        parsed["cumulative_rows"] = serde_json::json!(9999);
        client
            .put(&key, Bytes::from(serde_json::to_vec(&parsed).unwrap()))
            .await
            .unwrap();

        let err = ws.load(&table()).await.unwrap_err();
        assert!(matches!(err, WatermarkError::IntegrityFailure { .. }));
    }
}
