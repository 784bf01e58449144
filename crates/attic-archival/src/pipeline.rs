// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The batch pipeline: one batch driven through
//! Planning → Fetching → Serializing → Uploading → Verifying → Deleting
//! → Committing → Advancing, with any failure before commit rolling the
//! source transaction back. Strictly single-threaded per table: the
//! pipeline is the only writer of its transaction and watermark.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use attic_codec::{JsonlSerializer, PkValue, ReservedFields};
use attic_config::TableConfig;
use attic_db::{SourcePool, TableOps};
use attic_storage::ArchiveStore;

use crate::audit::{AuditEventKind, AuditTrail};
use crate::error::{ArchiveError, ErrorContext};
use crate::layout;
use crate::manifest::TableManifestStore;
use crate::metrics::ArchiveMetrics;
use crate::types::{
    BatchArtifact, BatchPlan, DeletionManifest, ManifestEntry, MetadataRecord, TableId,
    TableManifest, Watermark, METADATA_SCHEMA_VERSION,
};
use crate::verify;
use crate::watermark::WatermarkStore;

/// Pipeline states, in commit order. `Aborting` is the failure branch;
/// `Drained` is the terminal state once the table has no eligible rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    Planning,
    Fetching,
    Serializing,
    Uploading,
    Verifying,
    Deleting,
    Committing,
    Advancing,
    Aborting,
    Drained,
}

impl BatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::Idle => "idle",
            BatchPhase::Planning => "planning",
            BatchPhase::Fetching => "fetching",
            BatchPhase::Serializing => "serializing",
            BatchPhase::Uploading => "uploading",
            BatchPhase::Verifying => "verifying",
            BatchPhase::Deleting => "deleting",
            BatchPhase::Committing => "committing",
            BatchPhase::Advancing => "advancing",
            BatchPhase::Aborting => "aborting",
            BatchPhase::Drained => "drained",
        }
    }
}

/// Everything one batch needs, owned by the table orchestrator and
/// borrowed for the duration of a single batch.
pub struct BatchContext<'a> {
    pub table_id: &'a TableId,
    pub table_config: &'a TableConfig,
    pub ops: Arc<TableOps>,
    pub pool: &'a SourcePool,
    pub store: Arc<ArchiveStore>,
    pub manifest_store: &'a TableManifestStore,
    pub watermark_store: &'a WatermarkStore,
    pub audit: &'a AuditTrail,
    pub metrics: Arc<ArchiveMetrics>,
    pub prefix: Option<String>,
    pub compression_level: u32,
    pub cutoff: DateTime<Utc>,
    pub exclude_predicate: Option<String>,
    pub server_version: String,
    pub storage_class: Option<String>,
    pub dry_run: bool,
    pub run_id: String,
    pub shutdown: watch::Receiver<bool>,
    pub lock_lost: watch::Receiver<bool>,
}

impl BatchContext<'_> {
    fn error_context(&self, plan: Option<&BatchPlan>, phase: BatchPhase) -> ErrorContext {
        ErrorContext {
            table: Some(self.table_id.clone()),
            batch_ordinal: plan.map(|p| p.ordinal),
            fingerprint: plan.map(|p| p.fingerprint.clone()),
            phase: Some(phase.as_str()),
        }
    }

    fn interrupted(&self) -> bool {
        *self.shutdown.borrow() || *self.lock_lost.borrow()
    }
}

/// What one pipeline pass produced.
#[derive(Debug)]
pub enum BatchOutcome {
    /// The batch committed: rows uploaded, verified, deleted, watermark
    /// advanced.
    Committed {
        artifact: BatchArtifact,
        /// Keys for the asynchronous post-commit absence probe.
        sample_keys: Vec<PkValue>,
    },
    /// The fingerprint (or plan position) was already in the manifest;
    /// the watermark advanced from the stored artifact without work.
    IdempotentSkip { rows: u64 },
    /// Dry run: fetched and serialized, then rolled back. Carries the
    /// batch bounds so the caller can advance its in-memory cursor.
    DryRun {
        rows: u64,
        max_ts: DateTime<Utc>,
        max_pk: PkValue,
    },
    /// No eligible rows remain under the cutoff.
    Drained,
    /// Shutdown or lost lock before the commit point; rolled back.
    Interrupted,
}

/// Runs one batch. `watermark` and `manifest` are the orchestrator's
/// in-memory copies and are updated in place on success.
pub async fn run_batch(
    ctx: &BatchContext<'_>,
    watermark: &mut Watermark,
    manifest: &mut TableManifest,
    ordinal: u64,
    batch_size: usize,
    batch_started_at: DateTime<Utc>,
) -> Result<BatchOutcome, ArchiveError> {
    let db = &ctx.table_id.database;
    let table = &ctx.table_id.table;

    // Planning.
    let plan = BatchPlan::new(
        ctx.table_id.clone(),
        ctx.cutoff,
        watermark.cursor().map(|(ts, _)| ts),
        watermark.cursor().map(|(_, pk)| pk),
        batch_size,
        ordinal,
    );
    debug!(table = %ctx.table_id, ordinal, fingerprint = %plan.fingerprint, "batch planned");

    let committed_before = manifest
        .entries
        .iter()
        .find(|e| e.fingerprint == plan.fingerprint)
        .or_else(|| manifest.find_by_plan(plan.lo_ts.as_ref(), plan.lo_pk.as_ref()))
        .cloned();
    if let Some(entry) = committed_before {
        return idempotent_skip(ctx, watermark, &entry).await;
    }

    if ctx.interrupted() {
        return Ok(BatchOutcome::Interrupted);
    }

    // Fetching. The transaction opened here encloses everything through
    // the commit point.
    let fetch_started = Instant::now();
    let mut conn = ctx
        .pool
        .get()
        .await
        .map_err(|e| ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Fetching), e))?;
    let tx = conn
        .transaction()
        .await
        .map_err(|e| ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Fetching), e.into()))?;

    let rows = ctx
        .ops
        .fetch_batch(
            &tx,
            ctx.cutoff,
            watermark.cursor(),
            batch_size as i64,
            ctx.exclude_predicate.as_deref(),
        )
        .await
        .map_err(|e| ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Fetching), e))?;
    if rows.is_empty() {
        debug!(table = %ctx.table_id, "no eligible rows, table drained");
        return Ok(BatchOutcome::Drained);
    }
    let keys: Vec<PkValue> = rows.iter().map(|r| r.pk.clone()).collect();
    let n_db = ctx
        .ops
        .count_by_keys(&tx, &keys)
        .await
        .map_err(|e| ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Fetching), e))?;
    ctx.metrics
        .observe_phase(db, table, "fetch", fetch_started.elapsed().as_secs_f64());

    // Serializing.
    let serialize_started = Instant::now();
    let mut serializer = JsonlSerializer::new(
        ReservedFields {
            archived_at: batch_started_at,
            batch_id: plan.fingerprint.clone(),
            source_database: ctx.table_id.database.clone(),
            source_table: ctx.table_id.table.clone(),
        },
        ctx.compression_level,
    );
    for row in &rows {
        serializer
            .write_row(&row.columns)
            .map_err(|e| {
                ArchiveError::transient(ctx.error_context(Some(&plan), BatchPhase::Serializing), e)
            })?;
    }
    let n_stream = serializer.record_count();
    ctx.metrics.observe_phase(
        db,
        table,
        "serialize",
        serialize_started.elapsed().as_secs_f64(),
    );

    // Compression finalizes here; the encoder ran incrementally as rows
    // streamed through.
    let compress_started = Instant::now();
    let batch = serializer
        .finish()
        .map_err(|e| ArchiveError::transient(ctx.error_context(Some(&plan), BatchPhase::Serializing), e))?;
    ctx.metrics.observe_phase(
        db,
        table,
        "compress",
        compress_started.elapsed().as_secs_f64(),
    );
    let min_ts = rows.first().expect("non-empty").ts;
    let max_ts = rows.last().expect("non-empty").ts;
    let min_pk = rows.first().expect("non-empty").pk.clone();
    let max_pk = rows.last().expect("non-empty").pk.clone();

    if ctx.dry_run {
        info!(table = %ctx.table_id, ordinal, rows = n_stream,
            "dry run: rolling back without upload or delete");
        return Ok(BatchOutcome::DryRun {
            rows: n_stream,
            max_ts,
            max_pk,
        });
    }

    // Uploading. The caller fixes the batch start time before the first
    // attempt, so a retried or resumed batch re-derives the same keys
    // and reuses its in-flight upload instead of duplicating it.
    let upload_started = Instant::now();
    let data_key = layout::data_key(
        ctx.prefix.as_deref(),
        ctx.table_id,
        batch_started_at,
        ordinal,
    );
    let metadata_key = layout::metadata_key(
        ctx.prefix.as_deref(),
        ctx.table_id,
        batch_started_at,
        ordinal,
    );
    let deletion_key = layout::deletion_manifest_key(
        ctx.prefix.as_deref(),
        ctx.table_id,
        batch_started_at,
        ordinal,
    );

    ctx.store
        .put(&data_key, batch.compressed.clone())
        .await
        .map_err(|e| {
            ArchiveError::from_storage(ctx.error_context(Some(&plan), BatchPhase::Uploading), e)
        })?;

    let metadata = MetadataRecord {
        schema_version: METADATA_SCHEMA_VERSION,
        database: ctx.table_id.database.clone(),
        schema: ctx.table_id.schema.clone(),
        table: ctx.table_id.table.clone(),
        batch_ordinal: ordinal,
        batch_fingerprint: plan.fingerprint.clone(),
        archived_at: batch_started_at,
        min_row_timestamp: min_ts,
        max_row_timestamp: max_ts,
        record_count: batch.record_count,
        uncompressed_size: batch.uncompressed_len,
        compressed_size: batch.compressed_len,
        uncompressed_sha256: batch.uncompressed_sha256.clone(),
        compression: "gzip".to_string(),
        compression_level: ctx.compression_level,
        columns: ctx.ops.schema.columns.clone(),
        primary_key_column: ctx.ops.primary_key_column().to_string(),
        indexes: ctx.ops.schema.indexes.clone(),
        source_server_version: ctx.server_version.clone(),
        archiver_version: crate::ARCHIVER_VERSION.to_string(),
        deletion_manifest_key: deletion_key.to_string(),
        storage_class: ctx.storage_class.clone(),
    };
    let deletion_manifest = DeletionManifest {
        batch_fingerprint: plan.fingerprint.clone(),
        database: ctx.table_id.database.clone(),
        schema: ctx.table_id.schema.clone(),
        table: ctx.table_id.table.clone(),
        deleted_at: Utc::now(),
        primary_key_column: ctx.ops.primary_key_column().to_string(),
        primary_keys: keys.clone(),
        sorted_key_sha256: attic_codec::sorted_key_digest(&keys),
        delete_statement_sha256: DeletionManifest::statement_digest(
            &ctx.ops.delete_statement(),
            &keys,
        ),
        committed_row_count: n_db,
    };
    for (key, body) in [
        (&metadata_key, serde_json::to_vec_pretty(&metadata)),
        (&deletion_key, serde_json::to_vec_pretty(&deletion_manifest)),
    ] {
        let body = body
            .map_err(|e| ArchiveError::transient(ctx.error_context(Some(&plan), BatchPhase::Uploading), e))?;
        ctx.store.put(key, Bytes::from(body)).await.map_err(|e| {
            ArchiveError::from_storage(ctx.error_context(Some(&plan), BatchPhase::Uploading), e)
        })?;
    }
    ctx.metrics
        .observe_phase(db, table, "upload", upload_started.elapsed().as_secs_f64());

    // Verifying. The object must be durable and byte-identical before
    // any delete runs.
    let verify_started = Instant::now();
    let head = ctx.store.head(&data_key).await.map_err(|e| {
        ArchiveError::from_storage(ctx.error_context(Some(&plan), BatchPhase::Verifying), e)
    })?;
    verify::verify_upload_size(
        head.size as u64,
        batch.compressed_len,
        &ctx.error_context(Some(&plan), BatchPhase::Verifying),
    )?;
    verify::verify_counts(
        verify::BatchCounts {
            n_db,
            n_stream,
            n_object: batch.record_count,
        },
        &ctx.error_context(Some(&plan), BatchPhase::Verifying),
    )?;
    verify::verify_key_sets(
        &keys,
        &deletion_manifest.primary_keys,
        &ctx.error_context(Some(&plan), BatchPhase::Verifying),
    )?;
    ctx.metrics
        .observe_phase(db, table, "verify", verify_started.elapsed().as_secs_f64());

    // The manifest commits the batch's identity ahead of the delete:
    // a crash from here on is recognized by the next run, which skips
    // the batch and advances from the stored artifact bounds instead of
    // re-fetching rows that may already be gone.
    let entry = ManifestEntry {
        fingerprint: plan.fingerprint.clone(),
        ordinal,
        key: data_key.to_string(),
        run_id: ctx.run_id.clone(),
        lo_ts: plan.lo_ts,
        lo_pk: plan.lo_pk.clone(),
        max_ts,
        max_pk: max_pk.clone(),
        record_count: n_db,
        committed_at: Utc::now(),
    };
    *manifest = ctx
        .manifest_store
        .append(ctx.table_id, entry)
        .await
        .map_err(|e| {
            ArchiveError::transient(ctx.error_context(Some(&plan), BatchPhase::Uploading), e)
        })?;

    if ctx.interrupted() {
        warn!(table = %ctx.table_id, ordinal, "interrupted before delete, rolling back");
        return Ok(BatchOutcome::Interrupted);
    }

    // Deleting, inside a savepoint so a delete failure can roll back to
    // the fetch state without abandoning the transaction.
    let delete_started = Instant::now();
    let affected = {
        let mut tx = tx;
        let savepoint = tx.savepoint("before_delete").await.map_err(|e| {
            ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Deleting), e.into())
        })?;
        let affected = ctx
            .ops
            .delete_by_keys(&savepoint, &keys)
            .await
            .map_err(|e| ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Deleting), e))?;
        verify::verify_affected_rows(
            affected,
            n_db,
            &ctx.error_context(Some(&plan), BatchPhase::Deleting),
        )?;
        savepoint.commit().await.map_err(|e| {
            ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Deleting), e.into())
        })?;
        ctx.metrics
            .observe_phase(db, table, "delete", delete_started.elapsed().as_secs_f64());

        // Committing.
        let commit_started = Instant::now();
        tx.commit().await.map_err(|e| {
            ArchiveError::from_db(ctx.error_context(Some(&plan), BatchPhase::Committing), e.into())
        })?;
        ctx.metrics
            .observe_phase(db, table, "commit", commit_started.elapsed().as_secs_f64());
        affected
    };

    // Advancing: the watermark only moves after the commit.
    let advanced = watermark
        .advanced(max_ts, max_pk.clone(), n_db)
        .ok_or_else(|| {
            ArchiveError::permanent(
                ctx.error_context(Some(&plan), BatchPhase::Advancing),
                "batch bounds would move the watermark backwards",
            )
        })?;
    ctx.watermark_store
        .save(ctx.table_id, &advanced)
        .await
        .map_err(|e| ArchiveError::transient(ctx.error_context(Some(&plan), BatchPhase::Advancing), e))?;
    *watermark = advanced;

    ctx.audit
        .event(AuditEventKind::ArchiveBatchSuccess)
        .table(ctx.table_id)
        .rows(n_db)
        .duration(fetch_started.elapsed().as_secs_f64())
        .emit()
        .await;

    ctx.metrics
        .batches_committed
        .with_label_values(&[&ctx.table_id.database, &ctx.table_id.table])
        .inc();
    info!(table = %ctx.table_id, ordinal, rows = affected,
        bytes = batch.compressed_len, "batch committed");
    Ok(BatchOutcome::Committed {
        artifact: BatchArtifact {
            fingerprint: plan.fingerprint,
            key: data_key.to_string(),
            record_count: n_db,
            uncompressed_len: batch.uncompressed_len,
            compressed_len: batch.compressed_len,
            uncompressed_sha256: batch.uncompressed_sha256,
            compressed_sha256: batch.compressed_sha256,
            min_ts,
            max_ts,
            min_pk,
            max_pk,
        },
        sample_keys: verify::choose_sample(&keys),
    })
}

async fn idempotent_skip(
    ctx: &BatchContext<'_>,
    watermark: &mut Watermark,
    entry: &ManifestEntry,
) -> Result<BatchOutcome, ArchiveError> {
    info!(table = %ctx.table_id, fingerprint = %entry.fingerprint,
        "batch already committed, advancing watermark from manifest");
    if let Some(advanced) = watermark.advanced(
        entry.max_ts,
        entry.max_pk.clone(),
        entry.record_count,
    ) {
        ctx.watermark_store
            .save(ctx.table_id, &advanced)
            .await
            .map_err(|e| {
                ArchiveError::transient(ctx.error_context(None, BatchPhase::Advancing), e)
            })?;
        *watermark = advanced;
    }
    ctx.audit
        .event(AuditEventKind::ArchiveBatchSuccess)
        .table(ctx.table_id)
        .rows(entry.record_count)
        .idempotent_skip()
        .emit()
        .await;
    ctx.metrics
        .batches_skipped
        .with_label_values(&[&ctx.table_id.database, &ctx.table_id.table])
        .inc();
    Ok(BatchOutcome::IdempotentSkip {
        rows: entry.record_count,
    })
}
