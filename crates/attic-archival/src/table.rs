// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Drives one table's batches to drain: admission control, locking,
//! cutoff computation, the retry budget around each batch, adaptive
//! sizing, checkpoints, and post-table maintenance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use attic_config::{AtticConfig, DatabaseConfig, TableConfig};
use attic_db::{SourcePool, TableOps, TableSchema};
use attic_storage::ArchiveStore;

use crate::audit::{AuditEventKind, AuditTrail};
use crate::checkpoint::CheckpointStore;
use crate::compliance::{Admission, ComplianceGate};
use crate::error::{ArchiveError, ErrorContext};
use crate::lock::{table_lock_name, LockManager};
use crate::manifest::TableManifestStore;
use crate::metrics::ArchiveMetrics;
use crate::pipeline::{run_batch, BatchContext, BatchOutcome};
use crate::sizer::AdaptiveBatchSizer;
use crate::types::{Checkpoint, TableId, TableReport, TableStatus};
use crate::watermark::WatermarkStore;

const CHECKPOINT_GC_HOURS: i64 = 48;

/// Shared collaborators handed down from the run orchestrator.
pub struct TableRunEnv<'a> {
    pub config: &'a AtticConfig,
    pub db_config: &'a DatabaseConfig,
    pub pool: Arc<SourcePool>,
    pub store: Arc<ArchiveStore>,
    pub manifest_store: &'a TableManifestStore,
    pub watermark_store: &'a WatermarkStore,
    pub checkpoint_store: &'a CheckpointStore,
    pub audit: &'a AuditTrail,
    pub metrics: Arc<ArchiveMetrics>,
    pub gate: &'a ComplianceGate,
    pub lock_manager: &'a LockManager,
    pub run_id: &'a str,
    pub server_version: String,
    pub shutdown: watch::Receiver<bool>,
}

/// Runs one table to drain (or failure) and reports the outcome. A
/// failure here never propagates to other tables; fatals do.
pub async fn run_table(
    env: &TableRunEnv<'_>,
    table_config: &TableConfig,
) -> Result<TableReport, ArchiveError> {
    let id = TableId::new(
        &env.db_config.name,
        &table_config.schema,
        &table_config.table,
    );
    let started = Instant::now();
    let mut report = TableReport {
        table: id.clone(),
        batches_committed: 0,
        batches_skipped: 0,
        rows_archived: 0,
        bytes_uploaded: 0,
        status: TableStatus::Succeeded,
        error: None,
        duration_secs: 0.0,
    };

    // Admission control before any side effect. Anything short of a
    // fatal stays contained in this table's report.
    let result = async {
        let retention_days = env.config.retention_days_for(table_config);
        let admission = env
            .gate
            .check(&id, table_config, retention_days, Some(env.pool.as_ref()))
            .await?;
        let exclude_predicate = match admission {
            Admission::SkipLegalHold { reason } => {
                env.audit
                    .event(AuditEventKind::SkipLegalHold)
                    .table(&id)
                    .detail(serde_json::json!({ "reason": reason }))
                    .emit()
                    .await;
                return Ok(Some(TableStatus::SkippedLegalHold));
            }
            Admission::Proceed { exclude_predicate } => exclude_predicate,
        };

        let lock = env
            .lock_manager
            .acquire(&table_lock_name(&id), Some(env.pool.as_ref()))
            .await?;
        let result =
            archive_table(env, table_config, &id, &mut report, exclude_predicate, &lock).await;
        lock.release().await;
        result.map(|()| None)
    }
    .await;

    report.duration_secs = started.elapsed().as_secs_f64();
    match result {
        Ok(Some(status)) => {
            report.status = status;
            Ok(report)
        }
        Ok(None) => {
            env.audit
                .event(AuditEventKind::ArchiveSuccess)
                .table(&id)
                .rows(report.rows_archived)
                .duration(report.duration_secs)
                .emit()
                .await;
            Ok(report)
        }
        Err(e @ ArchiveError::Fatal { .. }) => Err(e),
        Err(e) => {
            error!(table = %id, error = %e, "table archival failed");
            env.metrics
                .tables_failed
                .with_label_values(&[&id.database])
                .inc();
            env.audit
                .event(AuditEventKind::ArchiveFailure)
                .table(&id)
                .failed(e.to_string())
                .duration(report.duration_secs)
                .emit()
                .await;
            report.status = TableStatus::Failed;
            report.error = Some(e.to_string());
            Ok(report)
        }
    }
}

async fn archive_table(
    env: &TableRunEnv<'_>,
    table_config: &TableConfig,
    id: &TableId,
    report: &mut TableReport,
    exclude_predicate: Option<String>,
    lock: &crate::lock::LockGuard,
) -> Result<(), ArchiveError> {
    let context = ErrorContext {
        table: Some(id.clone()),
        ..Default::default()
    };

    // Cutoff from server time; a skewed clock aborts the table before
    // any row is touched.
    let server_now = env
        .pool
        .server_now_checked()
        .await
        .map_err(|e| ArchiveError::from_db(context.clone(), e))?;
    let cutoff = server_now - chrono::Duration::days(env.config.retention_days_for(table_config) as i64);

    // Introspect and build the table's statements.
    let conn = env
        .pool
        .get()
        .await
        .map_err(|e| ArchiveError::from_db(context.clone(), e))?;
    let schema = TableSchema::introspect(&*conn, &table_config.schema, &table_config.table)
        .await
        .map_err(|e| ArchiveError::from_db(context.clone(), e))?;
    drop(conn);
    let ops = Arc::new(
        TableOps::new(
            schema,
            &table_config.timestamp_column,
            &table_config.primary_key_column,
        )
        .map_err(|e| ArchiveError::from_db(context.clone(), e))?,
    );

    // Durable state.
    let mut watermark = env
        .watermark_store
        .load(id)
        .await
        .map_err(|e| ArchiveError::table(context.clone(), e.to_string()))?;
    let mut manifest = env
        .manifest_store
        .load(id)
        .await
        .map_err(|e| ArchiveError::table(context.clone(), e.to_string()))?;

    // Schema drift is a warning, not an abort; the new hash rides along
    // on the next watermark write.
    let current_hash = ops.schema.canonical_hash();
    if let Some(previous) = &watermark.schema_hash {
        if *previous != current_hash {
            warn!(table = %id, "schema drift detected since last run");
        }
    }
    watermark.schema_hash = Some(current_hash);

    env.checkpoint_store
        .gc(id, CHECKPOINT_GC_HOURS)
        .await
        .map_err(|e| ArchiveError::table(context.clone(), e.to_string()))?;
    let checkpoint = env
        .checkpoint_store
        .load(id)
        .await
        .map_err(|e| ArchiveError::table(context.clone(), e.to_string()))?;

    let eligible = {
        let conn = env
            .pool
            .get()
            .await
            .map_err(|e| ArchiveError::from_db(context.clone(), e))?;
        ops.count_eligible(&*conn, cutoff)
            .await
            .map_err(|e| ArchiveError::from_db(context.clone(), e))?
    };
    env.metrics
        .eligible_rows
        .with_label_values(&[&id.database, &id.table])
        .set(eligible as i64);
    info!(table = %id, eligible, cutoff = %cutoff, "table run starting");

    env.audit
        .event(AuditEventKind::ArchiveStart)
        .table(id)
        .rows(eligible)
        .emit()
        .await;

    let mut sizer = AdaptiveBatchSizer::new(
        &env.config.defaults,
        env.config.batch_size_for(table_config),
    );
    let retry = env.config.defaults.retry;
    let batch_timeout = Duration::from_secs(env.config.run.batch_timeout_secs);
    let max_batches = table_config.max_batches_per_run.unwrap_or(u64::MAX);

    let mut ordinal = match &checkpoint {
        Some(cp) if cp.watermark.cursor() == watermark.cursor() => cp.batch_ordinal,
        _ => 0,
    };
    // Reuse the in-flight batch start time when resuming at the same
    // cursor, so the upload keys line up with any parked parts.
    let mut resume_started_at = checkpoint.as_ref().and_then(|cp| {
        (cp.watermark.cursor() == watermark.cursor())
            .then_some(cp.in_flight_started_at)
            .flatten()
    });
    let mut completed_fingerprints: Vec<String> =
        checkpoint.map(|cp| cp.completed_fingerprints).unwrap_or_default();

    loop {
        if ordinal >= max_batches {
            info!(table = %id, ordinal, "max batches per run reached");
            break;
        }
        if *env.shutdown.borrow() {
            info!(table = %id, "shutdown requested, stopping before next batch");
            break;
        }
        if lock.is_lost() {
            return Err(ArchiveError::transient(
                context.clone(),
                anyhow::anyhow!("table lock heartbeat lost"),
            ));
        }

        let batch_size = sizer.current();
        let batch_started_at = resume_started_at.take().unwrap_or_else(Utc::now);

        if env.checkpoint_store.should_save(ordinal) {
            env.checkpoint_store
                .save(&Checkpoint {
                    table: id.clone(),
                    run_id: env.run_id.to_string(),
                    batch_ordinal: ordinal,
                    watermark: watermark.clone(),
                    completed_fingerprints: completed_fingerprints.clone(),
                    in_flight_started_at: Some(batch_started_at),
                    saved_at: Utc::now(),
                })
                .await
                .map_err(|e| ArchiveError::table(context.clone(), e.to_string()))?;
        }

        let mut attempt = 1u32;
        let outcome = loop {
            let ctx = BatchContext {
                table_id: id,
                table_config,
                ops: ops.clone(),
                pool: env.pool.as_ref(),
                store: env.store.clone(),
                manifest_store: env.manifest_store,
                watermark_store: env.watermark_store,
                audit: env.audit,
                metrics: env.metrics.clone(),
                prefix: prefix(env),
                compression_level: env.config.defaults.compression_level,
                cutoff,
                exclude_predicate: exclude_predicate.clone(),
                server_version: env.server_version.clone(),
                storage_class: env.config.storage.storage_class.clone(),
                dry_run: env.config.run.dry_run,
                run_id: env.run_id.to_string(),
                shutdown: env.shutdown.clone(),
                lock_lost: lock.lost_signal(),
            };
            let fetch_started = Instant::now();
            let attempt_result = tokio::time::timeout(
                batch_timeout,
                run_batch(
                    &ctx,
                    &mut watermark,
                    &mut manifest,
                    ordinal,
                    batch_size,
                    batch_started_at,
                ),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ArchiveError::transient(
                    context.clone(),
                    anyhow::anyhow!("batch exceeded its {}s wall-clock budget", batch_timeout.as_secs()),
                ))
            });

            match attempt_result {
                Ok(outcome) => {
                    if let BatchOutcome::Committed { artifact, .. } = &outcome {
                        sizer.observe(
                            fetch_started.elapsed(),
                            artifact.record_count as usize,
                            artifact.compressed_len,
                        );
                        env.metrics
                            .current_batch_size
                            .with_label_values(&[&id.database, &id.table])
                            .set(sizer.current() as i64);
                    }
                    break outcome;
                }
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    env.metrics
                        .batch_errors
                        .with_label_values(&[&id.database, &id.table, "transient"])
                        .inc();
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(table = %id, ordinal, attempt, error = %e,
                        delay_ms = delay.as_millis() as u64, "batch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e @ ArchiveError::BatchPermanent { .. }) => {
                    // Verification failure: critical alert, then fail the
                    // whole table with no further batches.
                    env.metrics
                        .batch_errors
                        .with_label_values(&[&id.database, &id.table, "permanent"])
                        .inc();
                    env.audit
                        .event(AuditEventKind::Error)
                        .table(id)
                        .failed(e.to_string())
                        .detail(serde_json::json!({ "critical": true }))
                        .emit()
                        .await;
                    return Err(ArchiveError::table(
                        context.clone(),
                        format!("verification failed: {e}"),
                    ));
                }
                Err(e) if e.is_retryable() => {
                    // Retry budget exhausted: promote to a table error.
                    env.metrics
                        .batch_errors
                        .with_label_values(&[&id.database, &id.table, "exhausted"])
                        .inc();
                    return Err(ArchiveError::table(
                        context.clone(),
                        format!("batch retry budget exhausted: {e}"),
                    ));
                }
                Err(e) => return Err(e),
            }
        };

        match outcome {
            BatchOutcome::Committed {
                artifact,
                sample_keys,
            } => {
                report.batches_committed += 1;
                report.rows_archived += artifact.record_count;
                report.bytes_uploaded += artifact.compressed_len;
                env.metrics
                    .records_archived
                    .with_label_values(&[&id.database, &id.table])
                    .inc_by(artifact.record_count);
                env.metrics
                    .bytes_uploaded
                    .with_label_values(&[&id.database, &id.table])
                    .inc_by(artifact.compressed_len);
                completed_fingerprints.push(artifact.fingerprint.clone());
                spawn_sample_verification(env, id, ops.clone(), sample_keys);
                ordinal += 1;
            }
            BatchOutcome::IdempotentSkip { rows } => {
                report.batches_skipped += 1;
                info!(table = %id, ordinal, rows, "batch skipped idempotently");
                ordinal += 1;
            }
            BatchOutcome::DryRun { rows, max_ts, max_pk } => {
                report.rows_archived += rows;
                // Advance the cursor in memory only; nothing durable
                // changes in a dry run.
                if let Some(advanced) = watermark.advanced(max_ts, max_pk, rows) {
                    watermark = advanced;
                }
                ordinal += 1;
            }
            BatchOutcome::Drained => {
                info!(table = %id, ordinal, "table drained");
                break;
            }
            BatchOutcome::Interrupted => {
                info!(table = %id, ordinal, "batch interrupted, stopping table");
                break;
            }
        }
    }

    // A rerun that found nothing to do replays the last run's committed
    // batches into the audit trail as idempotent skips, so the trail
    // records that the work was already done.
    if report.batches_committed == 0 && report.batches_skipped == 0 && !manifest.entries.is_empty()
    {
        if let Some(last_run) = manifest
            .entries
            .iter()
            .max_by_key(|e| e.committed_at)
            .map(|e| e.run_id.clone())
        {
            for entry in manifest.entries.iter().filter(|e| e.run_id == last_run) {
                env.audit
                    .event(AuditEventKind::ArchiveBatchSuccess)
                    .table(id)
                    .rows(entry.record_count)
                    .idempotent_skip()
                    .emit()
                    .await;
                report.batches_skipped += 1;
            }
        }
    }

    // Post-table maintenance; an ineffective or overlong vacuum is
    // logged, never fatal.
    if report.batches_committed > 0 && !env.config.run.dry_run {
        let vacuum_started = Instant::now();
        match env.pool.get().await {
            Ok(conn) => {
                let size_before = ops.relation_size(&*conn).await.unwrap_or(0);
                if let Err(e) = ops
                    .vacuum(&*conn, table_config.vacuum_mode, batch_timeout)
                    .await
                {
                    warn!(table = %id, error = %e, "vacuum failed");
                } else if size_before > 0 {
                    let size_after = ops.relation_size(&*conn).await.unwrap_or(size_before);
                    let reclaimed = size_before.saturating_sub(size_after);
                    let fraction = reclaimed as f64 / size_before as f64;
                    if fraction < 0.01 {
                        warn!(table = %id, reclaimed, fraction,
                            "vacuum reclaimed little space");
                    } else {
                        info!(table = %id, reclaimed, fraction, "vacuum reclaimed space");
                    }
                }
                env.metrics.observe_phase(
                    &id.database,
                    &id.table,
                    "vacuum",
                    vacuum_started.elapsed().as_secs_f64(),
                );
            }
            Err(e) => warn!(table = %id, error = %e, "no connection for vacuum"),
        }
    }

    env.checkpoint_store
        .clear(id)
        .await
        .map_err(|e| ArchiveError::table(context.clone(), e.to_string()))?;
    Ok(())
}

fn prefix(env: &TableRunEnv<'_>) -> Option<String> {
    env.config.storage.prefix.clone()
}

/// Post-commit absence probe, run off the batch path. A surviving key
/// means a row the pipeline deleted is still visible, which is a critical
/// signal.
fn spawn_sample_verification(
    env: &TableRunEnv<'_>,
    id: &TableId,
    ops: Arc<TableOps>,
    sample_keys: Vec<attic_codec::PkValue>,
) {
    if sample_keys.is_empty() {
        return;
    }
    let pool = env.pool.clone();
    let audit = env.audit.clone();
    let id = id.clone();
    tokio::spawn(async move {
        let conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(table = %id, error = %e, "sample verification skipped: no connection");
                return;
            }
        };
        match ops.present_keys(&*conn, &sample_keys).await {
            Ok(present) if present.is_empty() => {
                tracing::debug!(table = %id, sampled = sample_keys.len(),
                    "sample absence check passed");
            }
            Ok(present) => {
                error!(table = %id, survivors = present.len(),
                    "CRITICAL: deleted keys still present in source");
                audit
                    .event(AuditEventKind::Error)
                    .table(&id)
                    .failed(format!(
                        "sample absence check found {} surviving keys",
                        present.len()
                    ))
                    .detail(serde_json::json!({ "critical": true }))
                    .emit()
                    .await;
            }
            Err(e) => {
                warn!(table = %id, error = %e, "sample absence check failed to run");
            }
        }
    });
}
