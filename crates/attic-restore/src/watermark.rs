// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use attic_archival::layout;
use attic_archival::types::TableId;
use attic_storage::ArchiveStore;

use crate::RestoreError;

/// Progress cursor for restores: the highest object key already loaded.
/// Keys sort lexicographically in archive order within a table, so a
/// single key bound is enough to make repeated restores no-ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreWatermark {
    pub last_restored_key: Option<String>,
    pub objects_restored: u64,
    pub records_restored: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RestoreWatermark {
    pub fn covers(&self, key: &str) -> bool {
        self.last_restored_key
            .as_deref()
            .is_some_and(|last| key <= last)
    }
}

pub struct RestoreWatermarkStore {
    store: Arc<ArchiveStore>,
    prefix: Option<String>,
}

impl RestoreWatermarkStore {
    pub fn new(store: Arc<ArchiveStore>, prefix: Option<String>) -> Self {
        Self { store, prefix }
    }

    fn key(&self, table: &TableId) -> object_store::path::Path {
        layout::restore_watermark_key(self.prefix.as_deref(), table)
    }

    pub async fn load(&self, table: &TableId) -> Result<RestoreWatermark, RestoreError> {
        match self.store.get(&self.key(table)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| RestoreError::BadMetadata {
                key: self.key(table).to_string(),
                detail: e.to_string(),
            }),
            Err(e) if e.is_not_found() => Ok(RestoreWatermark::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn advance(
        &self,
        table: &TableId,
        watermark: &mut RestoreWatermark,
        restored_key: &str,
        records: u64,
    ) -> Result<(), RestoreError> {
        if watermark
            .last_restored_key
            .as_deref()
            .is_none_or(|last| restored_key > last)
        {
            watermark.last_restored_key = Some(restored_key.to_string());
        }
        watermark.objects_restored += 1;
        watermark.records_restored += records;
        watermark.updated_at = Some(Utc::now());
        let body = serde_json::to_vec_pretty(watermark).expect("watermark serializes");
        self.store.put(&self.key(table), Bytes::from(body)).await?;
        debug!(table = %table, key = restored_key, "restore watermark advanced");
        Ok(())
    }
}
