// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Archive-then-restore round trip against a live Postgres. Enable with
//! `--features pg_integration` and point `ATTIC_TEST_DB_*` at a scratch
//! database.
#![cfg(feature = "pg_integration")]

use std::sync::Arc;

use attic_archival::metrics::ArchiveMetrics;
use attic_archival::run::RunOrchestrator;
use attic_archival::types::{TableId, TableStatus};
use attic_config::{AtticConfig, DatabaseConfig, TableConfig};
use attic_db::SourcePool;
use attic_restore::{ConflictStrategy, RestoreEngine, RestoreOptions, SchemaMigrationStrategy};
use attic_storage::{ObjectStoreConfig, ObjectStoreType};
use attic_util::health::HealthRegistry;
use tokio_postgres::NoTls;

const TABLE: &str = "attic_restore_roundtrip";

fn db_config() -> DatabaseConfig {
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
        tables: vec![TableConfig {
            schema: "public".to_string(),
            table: TABLE.to_string(),
            timestamp_column: "created_at".to_string(),
            primary_key_column: "id".to_string(),
            retention_days: Some(90),
            classification: None,
            critical: false,
            batch_size: Some(250),
            max_batches_per_run: None,
            vacuum_mode: attic_config::VacuumMode::None,
        }],
    }
}

async fn raw_client(db: &DatabaseConfig) -> tokio_postgres::Client {
    let password = std::env::var(&db.password_env).expect("test db password env");
    let (client, connection) = tokio_postgres::connect(&db.connection_string(&password), NoTls)
        .await
        .expect("connect to test database");
    tokio::spawn(connection);
    client
}

#[tokio::test]
async fn archive_truncate_restore_round_trips() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = AtticConfig {
        storage: ObjectStoreConfig {
            object_store: Some(ObjectStoreType::File),
            directory: Some(dir.path().join("store")),
            prefix: Some("archive".to_string()),
            ..Default::default()
        },
        databases: vec![db_config()],
        ..Default::default()
    };
    config.locking.backend = attic_config::LockBackend::Lease;
    let config = Arc::new(config);

    let client = raw_client(&config.databases[0]).await;
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS public.{TABLE};
             CREATE TABLE public.{TABLE} (
                 id bigint PRIMARY KEY,
                 created_at timestamptz NOT NULL,
                 actor text NOT NULL,
                 amount numeric(18, 6),
                 payload jsonb
             )"
        ))
        .await
        .unwrap();
    client
        .execute(
            &format!(
                "INSERT INTO public.{TABLE} (id, created_at, actor, amount, payload)
                 SELECT g, now() - make_interval(days => 100, secs => g),
                        'svc-' || (g % 7), g * 0.001,
                        jsonb_build_object('seq', g)
                 FROM generate_series(1, 1000) AS g"
            ),
            &[],
        )
        .await
        .unwrap();
    let fingerprint_before: Vec<tokio_postgres::Row> = client
        .query(
            &format!(
                "SELECT id, created_at, actor, amount::text, payload::text
                 FROM public.{TABLE} ORDER BY created_at, id"
            ),
            &[],
        )
        .await
        .unwrap();

    // Archive everything.
    let store = Arc::new(
        attic_storage::ArchiveStore::new(&config.storage, Default::default()).unwrap(),
    );
    let registry = prometheus::Registry::new();
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let summary = RunOrchestrator::new(
        config.clone(),
        store.clone(),
        ArchiveMetrics::new(&registry),
        HealthRegistry::new(),
        rx,
    )
    .run()
    .await
    .unwrap();
    assert_eq!(summary.tables[0].status, TableStatus::Succeeded);
    assert_eq!(summary.tables[0].rows_archived, 1000);

    let remaining: i64 = client
        .query_one(&format!("SELECT COUNT(*) FROM public.{TABLE}"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(remaining, 0);

    // Restore all four objects.
    let password = std::env::var("ATTIC_TEST_DB_PASSWORD").unwrap();
    let pool = Arc::new(
        SourcePool::connect(&config.databases[0], &password)
            .await
            .unwrap(),
    );
    let engine = RestoreEngine::new(
        store.clone(),
        pool.clone(),
        Some("archive".to_string()),
        RestoreOptions {
            restore_all: true,
            conflict_strategy: ConflictStrategy::Skip,
            schema_strategy: SchemaMigrationStrategy::Strict,
            ..Default::default()
        },
    );
    let id = TableId::new("attictest", "public", TABLE);
    let report = engine.run(&id).await.unwrap();
    assert_eq!(report.objects_restored, 4);
    assert_eq!(report.records_restored, 1000);
    assert_eq!(report.records_failed, 0);

    // Byte-equal rows in the declared ordering.
    let after: Vec<tokio_postgres::Row> = client
        .query(
            &format!(
                "SELECT id, created_at, actor, amount::text, payload::text
                 FROM public.{TABLE} ORDER BY created_at, id"
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(after.len(), fingerprint_before.len());
    for (before, restored) in fingerprint_before.iter().zip(after.iter()) {
        assert_eq!(before.get::<_, i64>(0), restored.get::<_, i64>(0));
        assert_eq!(
            before.get::<_, chrono::DateTime<chrono::Utc>>(1),
            restored.get::<_, chrono::DateTime<chrono::Utc>>(1)
        );
        assert_eq!(before.get::<_, String>(2), restored.get::<_, String>(2));
        assert_eq!(before.get::<_, String>(3), restored.get::<_, String>(3));
        assert_eq!(before.get::<_, String>(4), restored.get::<_, String>(4));
    }

    // A second restore is a no-op thanks to the restore watermark.
    let report2 = engine.run(&id).await.unwrap();
    assert_eq!(report2.objects_restored, 0);
    assert_eq!(report2.objects_skipped, 4);
    assert_eq!(report2.records_restored, 0);
}
