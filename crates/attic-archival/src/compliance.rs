// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Admission control ahead of a table run: legal holds, retention
//! bounds, and encryption enforcement for critical tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use attic_config::{ComplianceConfig, LegalHoldSourceConfig, TableConfig};
use attic_db::SourcePool;
use attic_storage::SseOption;

use crate::error::{ArchiveError, ErrorContext};
use crate::types::TableId;

/// One legal hold, table-wide or narrowed to a row predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalHold {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    pub reason: String,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requestor: Option<String>,
    /// SQL predicate identifying held rows; holds without one cover the
    /// whole table.
    #[serde(default)]
    pub record_predicate: Option<String>,
}

impl LegalHold {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let started = self.starts_at.map_or(true, |start| start <= now);
        let not_expired = self.expires_at.map_or(true, |end| end > now);
        started && not_expired
    }

    pub fn applies_to(&self, id: &TableId) -> bool {
        self.table == id.table
            && self.schema.as_deref().map_or(true, |s| s == id.schema)
            && self.database.as_deref().map_or(true, |d| d == id.database)
    }
}

/// Gate verdict for one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Run the table. Record-level holds narrow the candidate rows via
    /// the exclusion predicate.
    Proceed { exclude_predicate: Option<String> },
    /// An active table-wide hold short-circuits the table entirely.
    SkipLegalHold { reason: String },
}

pub struct ComplianceGate {
    config: ComplianceConfig,
    sse: SseOption,
    http: reqwest::Client,
}

impl ComplianceGate {
    pub fn new(config: ComplianceConfig, sse: SseOption) -> Self {
        Self {
            config,
            sse,
            http: reqwest::Client::new(),
        }
    }

    /// Runs every check ahead of a table's first batch. Holds are
    /// re-read from their source on each call; a failure to evaluate
    /// them aborts the table, never silently proceeds.
    pub async fn check(
        &self,
        id: &TableId,
        table: &TableConfig,
        retention_days: u32,
        pool: Option<&SourcePool>,
    ) -> Result<Admission, ArchiveError> {
        let context = ErrorContext {
            table: Some(id.clone()),
            ..Default::default()
        };

        if let Err(detail) = self
            .config
            .retention_bounds
            .check(retention_days, table.classification.as_deref())
        {
            return Err(ArchiveError::table(context, detail));
        }

        if table.critical
            && self.config.require_encryption_for_critical
            && self.sse == SseOption::None
        {
            return Err(ArchiveError::fatal(format!(
                "{id} is critical but storage-side encryption is disabled"
            )));
        }

        let holds = self.load_holds(pool).await.map_err(|e| {
            ArchiveError::table(context.clone(), format!("legal hold evaluation failed: {e}"))
        })?;

        let now = Utc::now();
        let mut predicates = vec![];
        for hold in holds.iter().filter(|h| h.applies_to(id) && h.is_active(now)) {
            match &hold.record_predicate {
                None => {
                    info!(table = %id, reason = %hold.reason, "table under legal hold, skipping");
                    return Ok(Admission::SkipLegalHold {
                        reason: hold.reason.clone(),
                    });
                }
                Some(predicate) => {
                    info!(table = %id, reason = %hold.reason, predicate = %predicate,
                        "record-level legal hold narrows candidate rows");
                    predicates.push(format!("({predicate})"));
                }
            }
        }

        Ok(Admission::Proceed {
            exclude_predicate: if predicates.is_empty() {
                None
            } else {
                Some(predicates.join(" OR "))
            },
        })
    }

    async fn load_holds(&self, pool: Option<&SourcePool>) -> anyhow::Result<Vec<LegalHold>> {
        match &self.config.legal_hold {
            LegalHoldSourceConfig::None => Ok(vec![]),
            LegalHoldSourceConfig::StaticFile { path } => {
                let raw = std::fs::read(path)?;
                Ok(serde_json::from_slice(&raw)?)
            }
            LegalHoldSourceConfig::Http { url } => {
                let response = self.http.get(url).send().await?.error_for_status()?;
                Ok(response.json().await?)
            }
            LegalHoldSourceConfig::Table { table } => {
                let pool = pool
                    .ok_or_else(|| anyhow::anyhow!("hold table configured but no pool given"))?;
                let quoted = attic_util::ident::quote_ident(table)?;
                let conn = pool.get().await?;
                let rows = conn
                    .query(
                        &format!(
                            "SELECT table_name, schema_name, database_name, reason, \
                             starts_at, expires_at, requestor, record_predicate FROM {quoted}"
                        ),
                        &[],
                    )
                    .await?;
                Ok(rows
                    .into_iter()
                    .map(|row| LegalHold {
                        table: row.get(0),
                        schema: row.get(1),
                        database: row.get(2),
                        reason: row.get(3),
                        starts_at: row.get(4),
                        expires_at: row.get(5),
                        requestor: row.get(6),
                        record_predicate: row.get(7),
                    })
                    .collect())
            }
        }
    }
}

/// A hold source that failed closed is a table error; log loudly when a
/// hold is present but expired, since operators often expect it to
/// still bind.
pub fn warn_on_expired_holds(holds: &[LegalHold], id: &TableId) {
    let now = Utc::now();
    for hold in holds {
        if hold.applies_to(id) && !hold.is_active(now) {
            warn!(table = %id, reason = %hold.reason, "legal hold present but not active");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attic_config::{RetentionBounds, VacuumMode};
    use chrono::Duration;

    fn table_config(critical: bool) -> TableConfig {
        TableConfig {
            schema: "public".into(),
            table: "audit_logs".into(),
            timestamp_column: "created_at".into(),
            primary_key_column: "id".into(),
            retention_days: Some(90),
            classification: None,
            critical,
            batch_size: None,
            max_batches_per_run: None,
            vacuum_mode: VacuumMode::default(),
        }
    }

    fn id() -> TableId {
        TableId::new("orders", "public", "audit_logs")
    }

    fn hold(reason: &str, predicate: Option<&str>) -> LegalHold {
        LegalHold {
            database: None,
            schema: Some("public".into()),
            table: "audit_logs".into(),
            reason: reason.to_string(),
            starts_at: Some(Utc::now() - Duration::days(1)),
            expires_at: Some(Utc::now() + Duration::days(1)),
            requestor: Some("legal".into()),
            record_predicate: predicate.map(str::to_string),
        }
    }

    fn gate_with_holds(holds: &[LegalHold]) -> (ComplianceGate, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("holds.json");
        std::fs::write(&path, serde_json::to_vec(holds).unwrap()).unwrap();
        let gate = ComplianceGate::new(
            ComplianceConfig {
                retention_bounds: RetentionBounds::default(),
                legal_hold: LegalHoldSourceConfig::StaticFile { path },
                require_encryption_for_critical: true,
            },
            SseOption::SseS3,
        );
        (gate, dir)
    }

    #[tokio::test]
    async fn no_holds_proceeds() {
        let (gate, _dir) = gate_with_holds(&[]);
        let admission = gate.check(&id(), &table_config(false), 90, None).await.unwrap();
        assert_eq!(
            admission,
            Admission::Proceed {
                exclude_predicate: None
            }
        );
    }

    #[tokio::test]
    async fn table_wide_hold_skips() {
        let (gate, _dir) = gate_with_holds(&[hold("case-X", None)]);
        let admission = gate.check(&id(), &table_config(false), 90, None).await.unwrap();
        assert_eq!(
            admission,
            Admission::SkipLegalHold {
                reason: "case-X".to_string()
            }
        );
    }

    #[tokio::test]
    async fn expired_hold_does_not_bind() {
        let mut expired = hold("old-case", None);
        expired.expires_at = Some(Utc::now() - Duration::days(1));
        let (gate, _dir) = gate_with_holds(&[expired]);
        let admission = gate.check(&id(), &table_config(false), 90, None).await.unwrap();
        assert!(matches!(admission, Admission::Proceed { .. }));
    }

    #[tokio::test]
    async fn record_holds_become_an_exclusion_predicate() {
        let (gate, _dir) = gate_with_holds(&[
            hold("case-A", Some("actor_id = 42")),
            hold("case-B", Some("tenant = 'acme'")),
        ]);
        let admission = gate.check(&id(), &table_config(false), 90, None).await.unwrap();
        match admission {
            Admission::Proceed {
                exclude_predicate: Some(predicate),
            } => {
                assert!(predicate.contains("(actor_id = 42)"));
                assert!(predicate.contains(" OR "));
                assert!(predicate.contains("(tenant = 'acme')"));
            }
            other => panic!("expected record-level predicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hold_for_other_table_is_ignored() {
        let mut other = hold("case-Y", None);
        other.table = "payments".to_string();
        let (gate, _dir) = gate_with_holds(&[other]);
        let admission = gate.check(&id(), &table_config(false), 90, None).await.unwrap();
        assert!(matches!(admission, Admission::Proceed { .. }));
    }

    #[tokio::test]
    async fn retention_out_of_bounds_aborts_table() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("holds.json");
        std::fs::write(&path, b"[]").unwrap();
        let gate = ComplianceGate::new(
            ComplianceConfig {
                retention_bounds: RetentionBounds {
                    min_days: 30,
                    max_days: 60,
                    per_classification: Default::default(),
                },
                legal_hold: LegalHoldSourceConfig::StaticFile { path },
                require_encryption_for_critical: true,
            },
            SseOption::SseS3,
        );
        let err = gate
            .check(&id(), &table_config(false), 90, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Table { .. }));
    }

    #[tokio::test]
    async fn critical_without_encryption_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("holds.json");
        std::fs::write(&path, b"[]").unwrap();
        let gate = ComplianceGate::new(
            ComplianceConfig {
                retention_bounds: RetentionBounds::default(),
                legal_hold: LegalHoldSourceConfig::StaticFile { path },
                require_encryption_for_critical: true,
            },
            SseOption::None,
        );
        let err = gate
            .check(&id(), &table_config(true), 90, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Fatal { .. }));
    }

    #[tokio::test]
    async fn unreadable_hold_source_fails_closed() {
        let gate = ComplianceGate::new(
            ComplianceConfig {
                retention_bounds: RetentionBounds::default(),
                legal_hold: LegalHoldSourceConfig::StaticFile {
                    path: "/nonexistent/holds.json".into(),
                },
                require_encryption_for_critical: true,
            },
            SseOption::SseS3,
        );
        let err = gate
            .check(&id(), &table_config(false), 90, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Table { .. }));
    }
}
