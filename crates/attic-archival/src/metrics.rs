// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

const PHASE_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10., 30., 60., 180., 600.,
];

/// Engine-wide metrics, labeled by database/table and pipeline phase.
pub struct ArchiveMetrics {
    pub records_archived: IntCounterVec,
    pub bytes_uploaded: IntCounterVec,
    pub batches_committed: IntCounterVec,
    pub batches_skipped: IntCounterVec,
    pub batch_errors: IntCounterVec,
    pub phase_duration: HistogramVec,
    pub current_batch_size: IntGaugeVec,
    pub tables_failed: IntCounterVec,
    pub last_success_epoch: IntGauge,
    pub eligible_rows: IntGaugeVec,
    pub fallback_pending: IntGauge,
}

impl ArchiveMetrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let this = Self {
            records_archived: register_int_counter_vec_with_registry!(
                "attic_records_archived",
                "Rows archived and deleted from the source",
                &["database", "table"],
                registry
            )
            .unwrap(),
            bytes_uploaded: register_int_counter_vec_with_registry!(
                "attic_bytes_uploaded",
                "Compressed bytes uploaded to the object store",
                &["database", "table"],
                registry
            )
            .unwrap(),
            batches_committed: register_int_counter_vec_with_registry!(
                "attic_batches_committed",
                "Batches that completed the verify-then-delete cycle",
                &["database", "table"],
                registry
            )
            .unwrap(),
            batches_skipped: register_int_counter_vec_with_registry!(
                "attic_batches_skipped",
                "Batches skipped because their fingerprint was already committed",
                &["database", "table"],
                registry
            )
            .unwrap(),
            batch_errors: register_int_counter_vec_with_registry!(
                "attic_batch_errors",
                "Batch failures by error class",
                &["database", "table", "class"],
                registry
            )
            .unwrap(),
            phase_duration: register_histogram_vec_with_registry!(
                "attic_phase_duration_seconds",
                "Duration of each pipeline phase",
                &["database", "table", "phase"],
                PHASE_LATENCY_SEC_BUCKETS.to_vec(),
                registry
            )
            .unwrap(),
            current_batch_size: register_int_gauge_vec_with_registry!(
                "attic_current_batch_size",
                "Adaptive batch size currently in force",
                &["database", "table"],
                registry
            )
            .unwrap(),
            tables_failed: register_int_counter_vec_with_registry!(
                "attic_tables_failed",
                "Tables that aborted during a run",
                &["database"],
                registry
            )
            .unwrap(),
            last_success_epoch: register_int_gauge_with_registry!(
                "attic_last_success_epoch",
                "Unix time of the last fully successful run",
                registry
            )
            .unwrap(),
            eligible_rows: register_int_gauge_vec_with_registry!(
                "attic_eligible_rows",
                "Rows under the cutoff at table start",
                &["database", "table"],
                registry
            )
            .unwrap(),
            fallback_pending: register_int_gauge_with_registry!(
                "attic_fallback_pending",
                "Payloads parked in the local fallback directory",
                registry
            )
            .unwrap(),
        };
        Arc::new(this)
    }

    pub fn observe_phase(&self, database: &str, table: &str, phase: &str, secs: f64) {
        self.phase_duration
            .with_label_values(&[database, table, phase])
            .observe(secs);
    }
}
