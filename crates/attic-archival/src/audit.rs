// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use attic_storage::ArchiveStore;

use crate::layout;
use crate::types::TableId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    ArchiveStart,
    ArchiveBatchSuccess,
    ArchiveSuccess,
    ArchiveFailure,
    SkipLegalHold,
    RestoreStart,
    RestoreSuccess,
    RestoreFailure,
    Error,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::ArchiveStart => "ARCHIVE_START",
            AuditEventKind::ArchiveBatchSuccess => "ARCHIVE_BATCH_SUCCESS",
            AuditEventKind::ArchiveSuccess => "ARCHIVE_SUCCESS",
            AuditEventKind::ArchiveFailure => "ARCHIVE_FAILURE",
            AuditEventKind::SkipLegalHold => "SKIP_LEGAL_HOLD",
            AuditEventKind::RestoreStart => "RESTORE_START",
            AuditEventKind::RestoreSuccess => "RESTORE_SUCCESS",
            AuditEventKind::RestoreFailure => "RESTORE_FAILURE",
            AuditEventKind::Error => "ERROR",
        }
    }
}

/// Immutable append-only audit record. Never modified once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub kind: AuditEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

/// Writes audit events to the object store under the audit prefix. Sink
/// failures are logged, never propagated: the pipeline must not fail
/// because its paper trail hiccuped.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<ArchiveStore>,
    prefix: Option<String>,
    actor: String,
}

impl AuditTrail {
    pub fn new(store: Arc<ArchiveStore>, prefix: Option<String>, run_id: &str) -> Self {
        Self {
            store,
            prefix,
            actor: format!("attic/{}@{run_id}", crate::ARCHIVER_VERSION),
        }
    }

    pub fn event(&self, kind: AuditEventKind) -> AuditEventBuilder<'_> {
        AuditEventBuilder {
            trail: self,
            event: AuditEvent {
                timestamp: Utc::now(),
                actor: self.actor.clone(),
                kind,
                table: None,
                row_count: None,
                duration_secs: None,
                status: "ok".to_string(),
                error_summary: None,
                detail: serde_json::Value::Null,
            },
        }
    }

    async fn write(&self, event: AuditEvent) {
        let key = layout::audit_key(self.prefix.as_deref(), event.timestamp, event.kind.as_str());
        let body = match serde_json::to_vec_pretty(&event) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode audit event");
                return;
            }
        };
        if let Err(e) = self.store.put(&key, Bytes::from(body)).await {
            error!(key = %key, error = %e, "failed to persist audit event");
        } else {
            info!(kind = event.kind.as_str(), key = %key, "audit event recorded");
        }
    }
}

pub struct AuditEventBuilder<'a> {
    trail: &'a AuditTrail,
    event: AuditEvent,
}

impl AuditEventBuilder<'_> {
    pub fn table(mut self, table: &TableId) -> Self {
        self.event.table = Some(table.clone());
        self
    }

    pub fn rows(mut self, rows: u64) -> Self {
        self.event.row_count = Some(rows);
        self
    }

    pub fn duration(mut self, secs: f64) -> Self {
        self.event.duration_secs = Some(secs);
        self
    }

    pub fn failed(mut self, summary: impl Into<String>) -> Self {
        self.event.status = "failed".to_string();
        self.event.error_summary = Some(summary.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.event.detail = detail;
        self
    }

    pub fn idempotent_skip(mut self) -> Self {
        self.event.detail = json!({ "idempotent_skip": true });
        self
    }

    pub async fn emit(self) {
        self.trail.write(self.event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn events_land_under_the_audit_prefix() {
        let store = Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new())));
        let trail = AuditTrail::new(store.clone(), Some("archive".to_string()), "run-1");
        trail
            .event(AuditEventKind::ArchiveStart)
            .table(&TableId::new("orders", "public", "audit_logs"))
            .emit()
            .await;

        let entries = store
            .list_sorted(&object_store::path::Path::from("archive/audit"))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].location.to_string().ends_with("_ARCHIVE_START.json"));

        let body = store.get(&entries[0].location).await.unwrap();
        let event: AuditEvent = serde_json::from_slice(&body).unwrap();
        assert_eq!(event.kind, AuditEventKind::ArchiveStart);
        assert_eq!(event.status, "ok");
    }

    #[tokio::test]
    async fn idempotent_skip_marks_detail() {
        let store = Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new())));
        let trail = AuditTrail::new(store.clone(), None, "run-1");
        trail
            .event(AuditEventKind::ArchiveBatchSuccess)
            .rows(250)
            .idempotent_skip()
            .emit()
            .await;

        let entries = store
            .list_sorted(&object_store::path::Path::from("audit"))
            .await
            .unwrap();
        let event: AuditEvent =
            serde_json::from_slice(&store.get(&entries[0].location).await.unwrap()).unwrap();
        assert_eq!(event.detail["idempotent_skip"], true);
        assert_eq!(event.row_count, Some(250));
    }
}
