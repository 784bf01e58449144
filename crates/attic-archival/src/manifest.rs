// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use attic_storage::{ArchiveStore, StorageError};

use crate::layout;
use crate::types::{ManifestEntry, TableId, TableManifest};

const MAX_CONDITIONAL_RETRIES: u32 = 5;

/// The per-table manifest of committed batch fingerprints, updated by
/// conditional write. The entry is appended after upload verification
/// and before the source delete commits: a fingerprint's presence means
/// the batch's data is durable and its deletion is at least in flight,
/// so a resumed run must skip it rather than re-fetch.
pub struct TableManifestStore {
    store: Arc<ArchiveStore>,
    prefix: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("manifest for {table} is not valid JSON: {source}")]
    Corrupt {
        table: TableId,
        source: serde_json::Error,
    },
    #[error("manifest update for {table} kept conflicting after {attempts} attempts")]
    ConflictExhausted { table: TableId, attempts: u32 },
}

impl TableManifestStore {
    pub fn new(store: Arc<ArchiveStore>, prefix: Option<String>) -> Self {
        Self { store, prefix }
    }

    fn key(&self, table: &TableId) -> object_store::path::Path {
        layout::table_manifest_key(self.prefix.as_deref(), table)
    }

    pub async fn load(&self, table: &TableId) -> Result<TableManifest, ManifestError> {
        Ok(self.load_versioned(table).await?.0)
    }

    async fn load_versioned(
        &self,
        table: &TableId,
    ) -> Result<(TableManifest, Option<object_store::UpdateVersion>), ManifestError> {
        match self.store.get_with_version(&self.key(table)).await {
            Ok((bytes, version)) => {
                let manifest = serde_json::from_slice(&bytes).map_err(|source| {
                    ManifestError::Corrupt {
                        table: table.clone(),
                        source,
                    }
                })?;
                Ok((manifest, Some(version)))
            }
            Err(e) if e.is_not_found() => Ok((TableManifest::default(), None)),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends one committed entry with read-merge-write semantics: on a
    /// conditional-write conflict the manifest is re-read, merged and
    /// retried a bounded number of times. The fingerprint appears at
    /// most once regardless of interleaving.
    pub async fn append(
        &self,
        table: &TableId,
        entry: ManifestEntry,
    ) -> Result<TableManifest, ManifestError> {
        let key = self.key(table);
        for attempt in 1..=MAX_CONDITIONAL_RETRIES {
            let (mut manifest, version) = self.load_versioned(table).await?;
            if manifest.contains(&entry.fingerprint) {
                debug!(table = %table, fingerprint = %entry.fingerprint,
                    "fingerprint already committed");
                return Ok(manifest);
            }
            manifest.merge(TableManifest {
                entries: vec![entry.clone()],
            });
            let body = Bytes::from(serde_json::to_vec_pretty(&manifest).expect("manifest serializes"));

            let result = match version {
                Some(version) => self.store.put_if_matches(&key, body, version).await,
                None => match self.store.put_if_absent(&key, body).await {
                    Ok(attic_storage::client::CreateOutcome::Created) => Ok(()),
                    Ok(attic_storage::client::CreateOutcome::AlreadyExists) => {
                        Err(StorageError::PreconditionFailed {
                            key: key.to_string(),
                        })
                    }
                    Err(e) => Err(e),
                },
            };
            match result {
                Ok(()) => return Ok(manifest),
                Err(StorageError::PreconditionFailed { .. }) => {
                    warn!(table = %table, attempt, "manifest conditional write conflict, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ManifestError::ConflictExhausted {
            table: table.clone(),
            attempts: MAX_CONDITIONAL_RETRIES,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attic_codec::PkValue;
    use chrono::{TimeZone, Utc};
    use object_store::memory::InMemory;

    fn table() -> TableId {
        TableId::new("orders", "public", "audit_logs")
    }

    fn entry(fp: &str, ordinal: u64) -> ManifestEntry {
        ManifestEntry {
            fingerprint: fp.to_string(),
            ordinal,
            key: format!("orders/public/audit_logs/batch_{ordinal}"),
            run_id: "run-1".to_string(),
            lo_ts: None,
            lo_pk: None,
            max_ts: Utc.timestamp_opt(1_700_000_000 + ordinal as i64, 0).unwrap(),
            max_pk: PkValue::Int(ordinal as i64 * 250),
            record_count: 250,
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_creates_then_extends() {
        let store = TableManifestStore::new(
            Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new()))),
            Some("archive".to_string()),
        );
        store.append(&table(), entry("fp-0", 0)).await.unwrap();
        store.append(&table(), entry("fp-1", 1)).await.unwrap();
        let manifest = store.load(&table()).await.unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert!(manifest.contains("fp-0"));
        assert!(manifest.contains("fp-1"));
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_a_noop() {
        let store = TableManifestStore::new(
            Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new()))),
            None,
        );
        store.append(&table(), entry("fp-0", 0)).await.unwrap();
        let manifest = store.append(&table(), entry("fp-0", 0)).await.unwrap();
        assert_eq!(manifest.entries.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_both_land() {
        let client = Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new())));
        let a = TableManifestStore::new(client.clone(), None);
        let b = TableManifestStore::new(client.clone(), None);
        let table_a = table();
        let table_b = table();
        let (ra, rb) = tokio::join!(
            a.append(&table_a, entry("fp-a", 0)),
            b.append(&table_b, entry("fp-b", 1)),
        );
        ra.unwrap();
        rb.unwrap();
        let manifest = a.load(&table()).await.unwrap();
        assert!(manifest.contains("fp-a"));
        assert!(manifest.contains("fp-b"));
    }

    #[tokio::test]
    async fn plan_lookup_finds_matching_lower_bound() {
        let store = TableManifestStore::new(
            Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new()))),
            None,
        );
        let mut e = entry("fp-0", 0);
        e.lo_ts = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        e.lo_pk = Some(PkValue::Int(250));
        store.append(&table(), e.clone()).await.unwrap();
        let manifest = store.load(&table()).await.unwrap();
        assert!(manifest
            .find_by_plan(e.lo_ts.as_ref(), e.lo_pk.as_ref())
            .is_some());
        assert!(manifest.find_by_plan(None, None).is_none());
    }
}
