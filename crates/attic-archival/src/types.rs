// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use attic_codec::PkValue;
use attic_db::{ColumnInfo, IndexInfo};

/// Identifies one source table across the whole system; the unit of
/// locking, watermarks and manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(database: &str, schema: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.table)
    }
}

/// The inputs of one batch. The fingerprint over these inputs is the
/// idempotency key for the whole verify-then-delete cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    pub table: TableId,
    pub cutoff: DateTime<Utc>,
    pub lo_ts: Option<DateTime<Utc>>,
    pub lo_pk: Option<PkValue>,
    pub limit: usize,
    pub ordinal: u64,
    pub fingerprint: String,
}

impl BatchPlan {
    pub fn new(
        table: TableId,
        cutoff: DateTime<Utc>,
        lo_ts: Option<DateTime<Utc>>,
        lo_pk: Option<PkValue>,
        limit: usize,
        ordinal: u64,
    ) -> Self {
        let fingerprint = compute_fingerprint(&table, cutoff, lo_ts.as_ref(), lo_pk.as_ref(), ordinal);
        Self {
            table,
            cutoff,
            lo_ts,
            lo_pk,
            limit,
            ordinal,
            fingerprint,
        }
    }
}

/// Deterministic hash over the batch inputs.
pub fn compute_fingerprint(
    table: &TableId,
    cutoff: DateTime<Utc>,
    lo_ts: Option<&DateTime<Utc>>,
    lo_pk: Option<&PkValue>,
    ordinal: u64,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        table.database.as_str(),
        table.schema.as_str(),
        table.table.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(cutoff.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    hasher.update(b"|");
    if let Some(ts) = lo_ts {
        hasher.update(ts.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    }
    hasher.update(b"|");
    if let Some(pk) = lo_pk {
        hasher.update(pk.to_canonical_string().as_bytes());
    }
    hasher.update(b"|");
    hasher.update(ordinal.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// The uploaded representation of one committed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchArtifact {
    pub fingerprint: String,
    pub key: String,
    pub record_count: u64,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
    pub uncompressed_sha256: String,
    pub compressed_sha256: String,
    pub min_ts: DateTime<Utc>,
    pub max_ts: DateTime<Utc>,
    pub min_pk: PkValue,
    pub max_pk: PkValue,
}

/// Per-batch metadata object, co-located with the data object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub schema_version: u32,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub batch_ordinal: u64,
    pub batch_fingerprint: String,
    pub archived_at: DateTime<Utc>,
    pub min_row_timestamp: DateTime<Utc>,
    pub max_row_timestamp: DateTime<Utc>,
    pub record_count: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub uncompressed_sha256: String,
    pub compression: String,
    pub compression_level: u32,
    pub columns: Vec<ColumnInfo>,
    pub primary_key_column: String,
    pub indexes: Vec<IndexInfo>,
    pub source_server_version: String,
    pub archiver_version: String,
    pub deletion_manifest_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Per-batch sidecar recording exactly which keys were deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionManifest {
    pub batch_fingerprint: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub deleted_at: DateTime<Utc>,
    pub primary_key_column: String,
    /// In fetch order, i.e. ascending `(ts, pk)`.
    pub primary_keys: Vec<PkValue>,
    pub sorted_key_sha256: String,
    pub delete_statement_sha256: String,
    pub committed_row_count: u64,
}

impl DeletionManifest {
    /// Digest of the parameterized delete plus the sorted key list.
    pub fn statement_digest(statement: &str, keys: &[PkValue]) -> String {
        let mut sorted: Vec<String> = keys.iter().map(PkValue::to_canonical_string).collect();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update(statement.as_bytes());
        hasher.update(b"\n");
        hasher.update(sorted.join(",").as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Append-only per-table index of committed batches. Entries store the
/// plan inputs and artifact bounds so a later run can recognize and
/// skip work it has already committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableManifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub fingerprint: String,
    pub ordinal: u64,
    pub key: String,
    /// Run that committed this batch; drives the idempotent-skip audit
    /// replay when a later run finds nothing left to do.
    pub run_id: String,
    pub lo_ts: Option<DateTime<Utc>>,
    pub lo_pk: Option<PkValue>,
    pub max_ts: DateTime<Utc>,
    pub max_pk: PkValue,
    pub record_count: u64,
    pub committed_at: DateTime<Utc>,
}

impl TableManifest {
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.iter().any(|e| e.fingerprint == fingerprint)
    }

    pub fn find_by_plan(
        &self,
        lo_ts: Option<&DateTime<Utc>>,
        lo_pk: Option<&PkValue>,
    ) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .find(|e| e.lo_ts.as_ref() == lo_ts && e.lo_pk.as_ref() == lo_pk)
    }

    /// Merges `other` into `self`, deduplicating by fingerprint and
    /// keeping ordinal order. Used by the conditional-write conflict
    /// path.
    pub fn merge(&mut self, other: TableManifest) {
        for entry in other.entries {
            if !self.contains(&entry.fingerprint) {
                self.entries.push(entry);
            }
        }
        self.entries.sort_by_key(|e| (e.committed_at, e.ordinal));
    }
}

/// Durable archival cursor for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub database: String,
    pub schema: String,
    pub table: String,
    pub last_ts: Option<DateTime<Utc>>,
    pub last_pk: Option<PkValue>,
    pub cumulative_rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// SHA-256 over the other fields, verified at load.
    #[serde(default)]
    pub content_sha256: String,
}

impl Watermark {
    pub fn initial(table: &TableId) -> Self {
        let mut w = Self {
            database: table.database.clone(),
            schema: table.schema.clone(),
            table: table.table.clone(),
            last_ts: None,
            last_pk: None,
            cumulative_rows: 0,
            schema_hash: None,
            updated_at: Utc::now(),
            content_sha256: String::new(),
        };
        w.content_sha256 = w.compute_hash();
        w
    }

    pub fn cursor(&self) -> Option<(DateTime<Utc>, PkValue)> {
        match (&self.last_ts, &self.last_pk) {
            (Some(ts), Some(pk)) => Some((*ts, pk.clone())),
            _ => None,
        }
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.database.as_bytes());
        hasher.update(b"|");
        hasher.update(self.schema.as_bytes());
        hasher.update(b"|");
        hasher.update(self.table.as_bytes());
        hasher.update(b"|");
        if let Some(ts) = &self.last_ts {
            hasher.update(ts.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
        }
        hasher.update(b"|");
        if let Some(pk) = &self.last_pk {
            hasher.update(pk.to_canonical_string().as_bytes());
        }
        hasher.update(b"|");
        hasher.update(self.cumulative_rows.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Monotonic advance: the new cursor must not move backwards.
    pub fn advanced(&self, max_ts: DateTime<Utc>, max_pk: PkValue, rows: u64) -> Option<Watermark> {
        if let Some((ts, pk)) = self.cursor() {
            if (max_ts, &max_pk) < (ts, &pk) {
                return None;
            }
        }
        let mut next = self.clone();
        next.last_ts = Some(max_ts);
        next.last_pk = Some(max_pk);
        next.cumulative_rows += rows;
        next.updated_at = Utc::now();
        next.content_sha256 = next.compute_hash();
        Some(next)
    }
}

/// In-flight state persisted every N batches for crash resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub table: TableId,
    pub run_id: String,
    pub batch_ordinal: u64,
    pub watermark: Watermark,
    pub completed_fingerprints: Vec<String>,
    /// Start time of a batch whose upload may still be in flight. A
    /// resumed run whose cursor matches re-derives the same object keys
    /// and picks the upload back up instead of duplicating it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_started_at: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

/// Outcome of one table within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: TableId,
    pub batches_committed: u64,
    pub batches_skipped: u64,
    pub rows_archived: u64,
    pub bytes_uploaded: u64,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableStatus {
    Succeeded,
    SkippedLegalHold,
    Failed,
}

/// Aggregated outcome of one run across all databases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub databases_processed: u64,
    pub databases_failed: u64,
    pub tables: Vec<TableReport>,
}

impl RunSummary {
    pub fn rows_archived(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_archived).sum()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.tables.iter().map(|t| t.bytes_uploaded).sum()
    }

    pub fn any_failed(&self) -> bool {
        self.tables.iter().any(|t| t.status == TableStatus::Failed)
    }

    pub fn any_succeeded(&self) -> bool {
        self.tables
            .iter()
            .any(|t| t.status == TableStatus::Succeeded)
    }
}
