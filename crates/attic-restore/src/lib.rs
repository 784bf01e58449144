// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The restore engine: inverts the archival pipeline by streaming
//! archived objects back into the source table with conflict
//! resolution, optional schema reconciliation, and its own watermark so
//! repeated restores are no-ops.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use attic_archival::audit::{AuditEventKind, AuditTrail};
use attic_archival::types::TableId;
use attic_storage::ArchiveStore;

pub mod engine;
pub mod schema;
pub mod watermark;

pub use engine::RestoreEngine;

/// Row-level behavior when a restored key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Leave the existing row, count the incoming one as skipped.
    #[default]
    Skip,
    /// Replace the existing row with the archived one.
    Overwrite,
    /// Abort the restore on the first conflict.
    Fail,
    /// Insert-or-update; identical to overwrite at the row level but
    /// counted as updates in the report.
    Upsert,
}

/// How archived column shapes are reconciled with the current table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaMigrationStrategy {
    /// Archived and current shapes must match exactly.
    #[default]
    Strict,
    /// Intersect: unknown archived columns are dropped, new table
    /// columns are left to their defaults.
    Lenient,
    /// Lenient plus server-side casts for compatible type changes.
    Transform,
    /// No reconciliation; the insert targets the archived column list.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, Args)]
#[serde(rename_all = "kebab-case", default)]
pub struct RestoreOptions {
    /// Restore a single archived object by its full key.
    #[clap(long)]
    pub object_key: Option<String>,
    /// Restore objects whose archive date partition is on/after this day.
    #[clap(long)]
    pub from_date: Option<NaiveDate>,
    /// Restore objects whose archive date partition is on/before this day.
    #[clap(long)]
    pub to_date: Option<NaiveDate>,
    /// Restore everything for the table.
    #[clap(long, default_value_t = false)]
    pub restore_all: bool,
    #[clap(long, value_enum, default_value_t = ConflictStrategy::Skip)]
    pub conflict_strategy: ConflictStrategy,
    #[clap(long, value_enum, default_value_t = SchemaMigrationStrategy::Strict)]
    pub schema_strategy: SchemaMigrationStrategy,
    /// Re-restore objects already covered by the restore watermark.
    #[clap(long, default_value_t = false)]
    pub ignore_restore_watermark: bool,
    /// Rows per insert transaction.
    #[clap(long, default_value_t = default_load_batch())]
    pub load_batch_size: usize,
}

fn default_load_batch() -> usize {
    50_000
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            object_key: None,
            from_date: None,
            to_date: None,
            restore_all: false,
            conflict_strategy: ConflictStrategy::default(),
            schema_strategy: SchemaMigrationStrategy::default(),
            ignore_restore_watermark: false,
            load_batch_size: default_load_batch(),
        }
    }
}

/// Outcome of one restore invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub table: Option<TableId>,
    pub objects_considered: u64,
    pub objects_restored: u64,
    pub objects_skipped: u64,
    pub records_restored: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("storage error: {0}")]
    Storage(#[from] attic_storage::StorageError),
    #[error("database error: {0}")]
    Db(#[from] attic_db::DbError),
    #[error("archived object {key} failed checksum validation")]
    ChecksumMismatch { key: String },
    #[error("metadata sidecar missing or unreadable for {key}: {detail}")]
    BadMetadata { key: String, detail: String },
    #[error("schema reconciliation failed: {0}")]
    Schema(String),
    #[error("decode error in {key}: {detail}")]
    Decode { key: String, detail: String },
    #[error("row conflict on restore into {table} and conflict strategy is fail")]
    Conflict { table: String },
}

/// Emits the restore audit events around an engine run.
pub async fn audited_restore(
    engine: &RestoreEngine,
    store: Arc<ArchiveStore>,
    prefix: Option<String>,
    table: &TableId,
) -> Result<RestoreReport, RestoreError> {
    let trail = AuditTrail::new(store, prefix, "restore");
    trail
        .event(AuditEventKind::RestoreStart)
        .table(table)
        .emit()
        .await;
    match engine.run(table).await {
        Ok(report) => {
            trail
                .event(AuditEventKind::RestoreSuccess)
                .table(table)
                .rows(report.records_restored)
                .emit()
                .await;
            info!(table = %table, restored = report.records_restored,
                skipped = report.records_skipped, "restore finished");
            Ok(report)
        }
        Err(e) => {
            warn!(table = %table, error = %e, "restore failed");
            trail
                .event(AuditEventKind::RestoreFailure)
                .table(table)
                .failed(e.to_string())
                .emit()
                .await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_defaults_are_conservative() {
        let options = RestoreOptions::default();
        assert_eq!(options.conflict_strategy, ConflictStrategy::Skip);
        assert_eq!(options.schema_strategy, SchemaMigrationStrategy::Strict);
        assert!(!options.ignore_restore_watermark);
        assert!(!options.restore_all);
    }
}
