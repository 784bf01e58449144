// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The run orchestrator: iterates databases sequentially or with
//! bounded parallelism, isolates their failures from one another, and
//! aggregates everything into a run summary written next to the audit
//! trail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use attic_config::{AtticConfig, DatabaseConfig};
use attic_db::SourcePool;
use attic_storage::ArchiveStore;
use attic_util::health::{ComponentStatus, HealthRegistry};

use crate::audit::{AuditEventKind, AuditTrail};
use crate::checkpoint::CheckpointStore;
use crate::compliance::ComplianceGate;
use crate::error::ArchiveError;
use crate::layout;
use crate::lock::{run_lock_name, LockManager};
use crate::manifest::TableManifestStore;
use crate::metrics::ArchiveMetrics;
use crate::table::{run_table, TableRunEnv};
use crate::types::{RunSummary, TableId, TableReport, TableStatus};
use crate::watermark::WatermarkStore;

const STALE_MULTIPART_AFTER: Duration = Duration::from_secs(24 * 3600);

/// One archival run across every configured database.
pub struct RunOrchestrator {
    config: Arc<AtticConfig>,
    store: Arc<ArchiveStore>,
    metrics: Arc<ArchiveMetrics>,
    health: HealthRegistry,
    shutdown: watch::Receiver<bool>,
}

impl RunOrchestrator {
    pub fn new(
        config: Arc<AtticConfig>,
        store: Arc<ArchiveStore>,
        metrics: Arc<ArchiveMetrics>,
        health: HealthRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            health,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, ArchiveError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let deadline = self
            .config
            .run
            .run_deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        info!(run_id = %run_id, databases = self.config.databases.len(), "archival run starting");

        // Startup recovery before any new work: drain the fallback
        // directory and abort abandoned multipart uploads.
        self.store
            .recover(STALE_MULTIPART_AFTER)
            .await
            .map_err(|e| ArchiveError::fatal(format!("object store unreachable: {e}")))?;
        self.health
            .set("object-store", ComponentStatus::Healthy, None);

        let prefix = self.config.storage.prefix.clone();
        let audit = AuditTrail::new(self.store.clone(), prefix.clone(), &run_id);
        audit.event(AuditEventKind::ArchiveStart).emit().await;

        // Pools for every database up front; a database that cannot
        // connect fails in isolation below, but the run lock may need
        // the first healthy pool for the advisory backend.
        let mut pools: Vec<(usize, Arc<SourcePool>)> = vec![];
        let mut pool_errors: Vec<(usize, String)> = vec![];
        for (idx, db) in self.config.databases.iter().enumerate() {
            match connect(db).await {
                Ok(pool) => {
                    self.health
                        .set(&format!("db:{}", db.name), ComponentStatus::Healthy, None);
                    pools.push((idx, Arc::new(pool)));
                }
                Err(e) => {
                    self.health.set(
                        &format!("db:{}", db.name),
                        ComponentStatus::Unhealthy,
                        Some(e.to_string()),
                    );
                    pool_errors.push((idx, e.to_string()));
                }
            }
        }

        let lock_manager = LockManager::new(
            self.config.locking.clone(),
            self.store.clone(),
            prefix.clone(),
        );
        let run_lock = lock_manager
            .acquire(&run_lock_name(), pools.first().map(|(_, p)| p.as_ref()))
            .await?;
        self.health.set("run-lock", ComponentStatus::Healthy, None);

        let manifest_store = TableManifestStore::new(self.store.clone(), prefix.clone());
        let watermark_store = WatermarkStore::new(self.store.clone(), prefix.clone());
        let checkpoint_store = CheckpointStore::new(
            self.store.clone(),
            prefix.clone(),
            self.config.defaults.checkpoint_every_batches,
        );
        let gate = ComplianceGate::new(self.config.compliance.clone(), self.config.storage.sse);

        let reports: Arc<Mutex<Vec<TableReport>>> = Arc::new(Mutex::new(vec![]));
        let failed_databases: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));

        // Databases that never connected: every table counts as failed.
        for (idx, error) in &pool_errors {
            let db = &self.config.databases[*idx];
            error!(database = %db.name, error = %error, "database unreachable, skipping");
            failed_databases.lock().push(db.name.clone());
            let mut reports = reports.lock();
            for table in &db.tables {
                reports.push(TableReport {
                    table: TableId::new(&db.name, &table.schema, &table.table),
                    batches_committed: 0,
                    batches_skipped: 0,
                    rows_archived: 0,
                    bytes_uploaded: 0,
                    status: TableStatus::Failed,
                    error: Some(error.clone()),
                    duration_secs: 0.0,
                });
            }
        }

        let parallelism = self.config.run.parallel_databases.max(1);
        let work = futures::stream::iter(pools.iter())
            .map(|(idx, pool)| {
                let db = &self.config.databases[*idx];
                self.process_database(
                    db,
                    pool.clone(),
                    &manifest_store,
                    &watermark_store,
                    &checkpoint_store,
                    &audit,
                    &gate,
                    &lock_manager,
                    &run_id,
                    deadline,
                    reports.clone(),
                    failed_databases.clone(),
                )
            })
            .buffer_unordered(parallelism)
            .collect::<Vec<Result<(), ArchiveError>>>();

        let grace = Duration::from_secs(self.config.run.grace_period_secs);
        let mut shutdown = self.shutdown.clone();
        tokio::pin!(work);
        let results = tokio::select! {
            results = &mut work => results,
            _ = shutdown.changed() => {
                warn!("shutdown signal received, letting in-flight tables finish");
                match tokio::time::timeout(grace, &mut work).await {
                    Ok(results) => results,
                    Err(_) => {
                        warn!(grace_secs = grace.as_secs(),
                            "grace period elapsed, abandoning remaining tables");
                        vec![]
                    }
                }
            }
        };
        // Fatals abort the run; everything else is already folded into
        // the per-table reports. The run lock is released either way.
        let fatal = results.into_iter().find_map(Result::err);
        run_lock.release().await;
        if let Some(e) = fatal {
            return Err(e);
        }

        let tables = reports.lock().clone();
        let failed = failed_databases.lock().clone();
        let summary = RunSummary {
            run_id: run_id.clone(),
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            databases_processed: (self.config.databases.len() - failed.len()) as u64,
            databases_failed: failed.len() as u64,
            tables,
        };

        self.metrics
            .fallback_pending
            .set(self.store.fallback_pending() as i64);
        if !summary.any_failed() {
            self.metrics.last_success_epoch.set(Utc::now().timestamp());
            audit
                .event(AuditEventKind::ArchiveSuccess)
                .rows(summary.rows_archived())
                .emit()
                .await;
        } else {
            audit
                .event(AuditEventKind::ArchiveFailure)
                .failed(format!(
                    "{} of {} tables failed",
                    summary
                        .tables
                        .iter()
                        .filter(|t| t.status == TableStatus::Failed)
                        .count(),
                    summary.tables.len()
                ))
                .emit()
                .await;
        }
        self.write_report(&summary, prefix.as_deref()).await;

        info!(run_id = %run_id, rows = summary.rows_archived(),
            bytes = summary.bytes_uploaded(), failed_tables = summary.any_failed(),
            "archival run finished");
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_database(
        &self,
        db_config: &DatabaseConfig,
        pool: Arc<SourcePool>,
        manifest_store: &TableManifestStore,
        watermark_store: &WatermarkStore,
        checkpoint_store: &CheckpointStore,
        audit: &AuditTrail,
        gate: &ComplianceGate,
        lock_manager: &LockManager,
        run_id: &str,
        deadline: Option<Instant>,
        reports: Arc<Mutex<Vec<TableReport>>>,
        failed_databases: Arc<Mutex<Vec<String>>>,
    ) -> Result<(), ArchiveError> {
        let server_version = match pool.server_version().await {
            Ok(version) => version,
            Err(e) => {
                error!(database = %db_config.name, error = %e, "cannot read server version");
                failed_databases.lock().push(db_config.name.clone());
                return Ok(());
            }
        };

        let mut any_failed = false;
        for table_config in &db_config.tables {
            if *self.shutdown.borrow() {
                info!(database = %db_config.name, "shutdown requested, not starting more tables");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(database = %db_config.name,
                    "run deadline reached, not starting more tables");
                break;
            }

            let env = TableRunEnv {
                config: &self.config,
                db_config,
                pool: pool.clone(),
                store: self.store.clone(),
                manifest_store,
                watermark_store,
                checkpoint_store,
                audit,
                metrics: self.metrics.clone(),
                gate,
                lock_manager,
                run_id,
                server_version: server_version.clone(),
                shutdown: self.shutdown.clone(),
            };
            let report = run_table(&env, table_config).await?;
            any_failed |= report.status == TableStatus::Failed;
            reports.lock().push(report);
        }
        if any_failed {
            failed_databases.lock().push(db_config.name.clone());
        }
        Ok(())
    }

    async fn write_report(&self, summary: &RunSummary, prefix: Option<&str>) {
        let key = layout::run_report_key(prefix, Utc::now(), &summary.run_id);
        match serde_json::to_vec_pretty(summary) {
            Ok(body) => {
                if let Err(e) = self.store.put(&key, Bytes::from(body)).await {
                    error!(key = %key, error = %e, "failed to write run report");
                }
            }
            Err(e) => error!(error = %e, "failed to encode run report"),
        }
    }
}

async fn connect(db: &DatabaseConfig) -> Result<SourcePool, ArchiveError> {
    let password = AtticConfig::resolve_env(&db.password_env)
        .map_err(|e| ArchiveError::fatal(e.to_string()))?;
    let pool = SourcePool::connect(db, &password)
        .await
        .map_err(|e| ArchiveError::fatal(format!("{}: {e}", db.name)))?;
    pool.health_check()
        .await
        .map_err(|e| ArchiveError::fatal(format!("{}: {e}", db.name)))?;
    Ok(pool)
}

/// Exit code mapping per the operational contract.
pub fn exit_code(result: &Result<RunSummary, ArchiveError>) -> i32 {
    match result {
        Ok(summary) => {
            if !summary.any_failed() {
                0
            } else if summary.any_succeeded() {
                1
            } else {
                2
            }
        }
        Err(ArchiveError::LockUnavailable { .. }) => 4,
        Err(ArchiveError::Fatal { message }) => {
            let lowered = message.to_lowercase();
            if lowered.contains("permission") || lowered.contains("denied") {
                5
            } else if lowered.contains("no space") || lowered.contains("resource") {
                6
            } else if lowered.contains("unreachable")
                || lowered.contains("network")
                || lowered.contains("timed out")
            {
                7
            } else {
                2
            }
        }
        Err(_) => 2,
    }
}
