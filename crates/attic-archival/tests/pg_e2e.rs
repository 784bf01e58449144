// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end archival runs against a live Postgres. Ignored unless the
//! `pg_integration` feature is enabled and `ATTIC_TEST_DB_*` points at a
//! scratch database:
//!
//! ```text
//! ATTIC_TEST_DB_PASSWORD=postgres \
//!   cargo test -p attic-archival --features pg_integration
//! ```
#![cfg(feature = "pg_integration")]

use std::sync::Arc;

use attic_archival::layout;
use attic_archival::metrics::ArchiveMetrics;
use attic_archival::run::RunOrchestrator;
use attic_archival::types::{TableId, TableStatus, Watermark};
use attic_config::{AtticConfig, DatabaseConfig, LegalHoldSourceConfig, TableConfig};
use attic_storage::{ObjectStoreConfig, ObjectStoreType};
use attic_util::health::HealthRegistry;
use tokio_postgres::NoTls;

fn test_db_config(tables: Vec<TableConfig>) -> DatabaseConfig {
    DatabaseConfig {
        name: "attictest".to_string(),
        host: std::env::var("ATTIC_TEST_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("ATTIC_TEST_DB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432),
        user: std::env::var("ATTIC_TEST_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
        password_env: "ATTIC_TEST_DB_PASSWORD".to_string(),
        dbname: std::env::var("ATTIC_TEST_DB_NAME").unwrap_or_else(|_| "postgres".to_string()),
        pool_size: 5,
        statement_timeout_secs: 300,
        tables,
    }
}

fn audit_logs_table(name: &str, batch_size: usize) -> TableConfig {
    TableConfig {
        schema: "public".to_string(),
        table: name.to_string(),
        timestamp_column: "created_at".to_string(),
        primary_key_column: "id".to_string(),
        retention_days: Some(90),
        classification: None,
        critical: false,
        batch_size: Some(batch_size),
        max_batches_per_run: None,
        vacuum_mode: attic_config::VacuumMode::None,
    }
}

async fn raw_client(db: &DatabaseConfig) -> tokio_postgres::Client {
    let password = std::env::var(&db.password_env).expect("test db password env");
    let (client, connection) =
        tokio_postgres::connect(&db.connection_string(&password), NoTls)
            .await
            .expect("connect to test database");
    tokio::spawn(connection);
    client
}

async fn seed_audit_logs(client: &tokio_postgres::Client, name: &str, rows: i64, age_days: i32) {
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS public.{name};
             CREATE TABLE public.{name} (
                 id bigint PRIMARY KEY,
                 created_at timestamptz NOT NULL,
                 actor text NOT NULL,
                 payload jsonb
             )"
        ))
        .await
        .expect("create test table");
    client
        .execute(
            &format!(
                "INSERT INTO public.{name} (id, created_at, actor, payload)
                 SELECT g, now() - make_interval(days => $1), 'svc-' || (g % 7),
                        jsonb_build_object('seq', g)
                 FROM generate_series(1, $2) AS g"
            ),
            &[&age_days, &rows],
        )
        .await
        .expect("seed rows");
}

struct Harness {
    config: Arc<AtticConfig>,
    store: Arc<attic_storage::ArchiveStore>,
    _dir: tempfile::TempDir,
}

fn harness(tables: Vec<TableConfig>, legal_hold: LegalHoldSourceConfig) -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = AtticConfig {
        storage: ObjectStoreConfig {
            object_store: Some(ObjectStoreType::File),
            directory: Some(dir.path().join("store")),
            prefix: Some("archive".to_string()),
            fallback_directory: Some(dir.path().join("fallback")),
            ..Default::default()
        },
        databases: vec![test_db_config(tables)],
        ..Default::default()
    };
    config.compliance.legal_hold = legal_hold;
    config.locking.backend = attic_config::LockBackend::Lease;
    let store = Arc::new(
        attic_storage::ArchiveStore::new(&config.storage, Default::default()).unwrap(),
    );
    Harness {
        config: Arc::new(config),
        store,
        _dir: dir,
    }
}

async fn run(harness: &Harness) -> attic_archival::types::RunSummary {
    let registry = prometheus::Registry::new();
    let metrics = ArchiveMetrics::new(&registry);
    let (_tx, rx) = tokio::sync::watch::channel(false);
    RunOrchestrator::new(
        harness.config.clone(),
        harness.store.clone(),
        metrics,
        HealthRegistry::new(),
        rx,
    )
    .run()
    .await
    .expect("run completes")
}

#[tokio::test]
async fn clean_archive_then_idempotent_rerun() {
    let harness = harness(
        vec![audit_logs_table("attic_clean_archive", 250)],
        LegalHoldSourceConfig::None,
    );
    let client = raw_client(&harness.config.databases[0]).await;
    seed_audit_logs(&client, "attic_clean_archive", 1000, 100).await;

    // First run: four batches of 250, source drained.
    let summary = run(&harness).await;
    assert_eq!(summary.tables.len(), 1);
    let report = &summary.tables[0];
    assert_eq!(report.status, TableStatus::Succeeded);
    assert_eq!(report.batches_committed, 4);
    assert_eq!(report.rows_archived, 1000);

    let remaining: i64 = client
        .query_one(&format!("SELECT COUNT(*) FROM public.{}", "attic_clean_archive"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(remaining, 0);

    let id = TableId::new("attictest", "public", "attic_clean_archive");
    let table_prefix = layout::table_prefix(Some("archive"), &id);
    let objects = harness.store.list_sorted(&table_prefix).await.unwrap();
    let names: Vec<String> = objects.iter().map(|o| o.location.to_string()).collect();
    assert_eq!(
        names.iter().filter(|n| n.ends_with(".jsonl.gz")).count(),
        4,
        "expected 4 data objects, got {names:?}"
    );
    assert_eq!(names.iter().filter(|n| n.ends_with("_metadata.json")).count(), 4);
    assert_eq!(
        names
            .iter()
            .filter(|n| n.ends_with("_manifest.json") && !n.ends_with("/_manifest.json"))
            .count(),
        4
    );
    assert!(names.iter().any(|n| n.ends_with("/_watermark.json")));
    assert!(names.iter().any(|n| n.ends_with("/_manifest.json")));

    let watermark_bytes = harness
        .store
        .get(&layout::watermark_key(Some("archive"), &id))
        .await
        .unwrap();
    let watermark: Watermark = serde_json::from_slice(&watermark_bytes).unwrap();
    assert_eq!(watermark.cumulative_rows, 1000);
    assert_eq!(watermark.content_sha256, watermark.compute_hash());

    // Second run on the drained table: no deletions, no new data
    // objects, watermark untouched, batches reported as skips.
    let object_count_before = harness.store.list_sorted(&table_prefix).await.unwrap().len();
    let summary2 = run(&harness).await;
    let report2 = &summary2.tables[0];
    assert_eq!(report2.status, TableStatus::Succeeded);
    assert_eq!(report2.batches_committed, 0);
    assert_eq!(report2.batches_skipped, 4);
    assert_eq!(report2.rows_archived, 0);

    let objects_after = harness.store.list_sorted(&table_prefix).await.unwrap();
    assert_eq!(
        objects_after
            .iter()
            .filter(|o| o.location.to_string().ends_with(".jsonl.gz"))
            .count() as u64,
        4
    );
    assert_eq!(object_count_before,
        objects_after.len());

    let watermark2: Watermark = serde_json::from_slice(
        &harness
            .store
            .get(&layout::watermark_key(Some("archive"), &id))
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(watermark2.cursor(), watermark.cursor());
    assert_eq!(watermark2.cumulative_rows, 1000);
}

#[tokio::test]
async fn cutoff_is_strictly_exclusive() {
    let harness = harness(
        vec![audit_logs_table("attic_cutoff", 1000)],
        LegalHoldSourceConfig::None,
    );
    let client = raw_client(&harness.config.databases[0]).await;
    seed_audit_logs(&client, "attic_cutoff", 100, 100).await;
    // Rows newer than the cutoff must survive.
    client
        .execute(
            "INSERT INTO public.attic_cutoff (id, created_at, actor)
             SELECT 1000 + g, now() - make_interval(days => 10), 'recent'
             FROM generate_series(1, 50) AS g",
            &[],
        )
        .await
        .unwrap();

    let summary = run(&harness).await;
    assert_eq!(summary.tables[0].rows_archived, 100);
    let remaining: i64 = client
        .query_one(&format!("SELECT COUNT(*) FROM public.{}", "attic_cutoff"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(remaining, 50);
}

#[tokio::test]
async fn legal_hold_short_circuits_the_table() {
    let dir = tempfile::TempDir::new().unwrap();
    let holds_path = dir.path().join("holds.json");
    std::fs::write(
        &holds_path,
        serde_json::json!([{
            "table": "attic_legal_hold",
            "schema": "public",
            "reason": "case-X",
            "starts_at": chrono::Utc::now() - chrono::Duration::days(1),
            "expires_at": chrono::Utc::now() + chrono::Duration::days(1),
        }])
        .to_string(),
    )
    .unwrap();

    let harness = harness(
        vec![audit_logs_table("attic_legal_hold", 250)],
        LegalHoldSourceConfig::StaticFile { path: holds_path },
    );
    let client = raw_client(&harness.config.databases[0]).await;
    seed_audit_logs(&client, "attic_legal_hold", 200, 100).await;

    let summary = run(&harness).await;
    assert_eq!(summary.tables[0].status, TableStatus::SkippedLegalHold);

    // Nothing deleted, no data object written.
    let remaining: i64 = client
        .query_one(&format!("SELECT COUNT(*) FROM public.{}", "attic_legal_hold"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(remaining, 200);

    let id = TableId::new("attictest", "public", "attic_legal_hold");
    let objects = harness
        .store
        .list_sorted(&layout::table_prefix(Some("archive"), &id))
        .await
        .unwrap();
    assert!(objects.is_empty(), "unexpected objects: {objects:?}");

    // Exactly one SKIP_LEGAL_HOLD audit event carrying the reason.
    let audit_objects = harness
        .store
        .list_sorted(&object_store::path::Path::from("archive/audit"))
        .await
        .unwrap();
    let mut skip_events = 0;
    for object in &audit_objects {
        if object.location.to_string().contains("_SKIP_LEGAL_HOLD") {
            skip_events += 1;
            let event: serde_json::Value =
                serde_json::from_slice(&harness.store.get(&object.location).await.unwrap())
                    .unwrap();
            assert_eq!(event["detail"]["reason"], "case-X");
        }
    }
    assert_eq!(skip_events, 1);
}
