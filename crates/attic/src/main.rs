// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use attic_archival::metrics::ArchiveMetrics;
use attic_archival::run::{exit_code, RunOrchestrator};
use attic_archival::types::TableId;
use attic_config::AtticConfig;
use attic_restore::{audited_restore, RestoreEngine, RestoreOptions};
use attic_storage::ArchiveStore;
use attic_util::health::HealthRegistry;

mod validate;

const EXIT_VALIDATION_ERROR: i32 = 3;

#[derive(Parser)]
#[command(name = "attic", version, about = "Archives cold audit rows to object storage with a verify-then-delete guarantee")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the archival pipeline over every configured database.
    Archive {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Restore archived objects back into a source table.
    Restore {
        #[arg(long, short)]
        config: PathBuf,
        /// Logical database name from the configuration.
        #[arg(long)]
        database: String,
        #[arg(long, default_value = "public")]
        schema: String,
        #[arg(long)]
        table: String,
        #[clap(flatten)]
        options: RestoreOptions,
    },
    /// Load and validate the configuration, then exit.
    ValidateConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Re-read archived objects and verify their checksums against their
    /// metadata records.
    ValidateArchive {
        #[arg(long, short)]
        config: PathBuf,
        #[arg(long)]
        database: String,
        #[arg(long, default_value = "public")]
        schema: String,
        #[arg(long)]
        table: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let code = match args.command {
        Command::Archive { config } => archive(config).await,
        Command::Restore {
            config,
            database,
            schema,
            table,
            options,
        } => restore(config, database, schema, table, options).await,
        Command::ValidateConfig { config } => match AtticConfig::load(&config) {
            Ok(loaded) => {
                info!(
                    databases = loaded.databases.len(),
                    "configuration is valid"
                );
                0
            }
            Err(e) => {
                error!("{e}");
                EXIT_VALIDATION_ERROR
            }
        },
        Command::ValidateArchive {
            config,
            database,
            schema,
            table,
        } => validate_archive(config, database, schema, table).await,
    };
    std::process::exit(code);
}

async fn archive(config_path: PathBuf) -> i32 {
    let config = match AtticConfig::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            return EXIT_VALIDATION_ERROR;
        }
    };
    let store = match ArchiveStore::new(&config.storage, config.defaults.retry) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot initialize object store");
            return 7;
        }
    };

    let registry = prometheus::Registry::new();
    let metrics = ArchiveMetrics::new(&registry);
    let health = HealthRegistry::new();
    if config.metrics.enabled {
        match config.metrics.listen.parse() {
            Ok(addr) => {
                let registry = registry.clone();
                let health = health.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        attic_util::metrics::start_observability_server(addr, registry, health)
                            .await
                    {
                        error!(error = %e, "observability server exited");
                    }
                });
            }
            Err(e) => error!(error = %e, listen = %config.metrics.listen,
                "invalid metrics listen address, metrics disabled"),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, beginning graceful shutdown");
            let _ = shutdown_tx.send(true);
        }
    });

    let orchestrator = RunOrchestrator::new(config, store, metrics, health, shutdown_rx);
    let result = orchestrator.run().await;
    if let Err(e) = &result {
        error!("{e}");
    }
    exit_code(&result)
}

async fn restore(
    config_path: PathBuf,
    database: String,
    schema: String,
    table: String,
    options: RestoreOptions,
) -> i32 {
    let config = match AtticConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return EXIT_VALIDATION_ERROR;
        }
    };
    let Some(db_config) = config.databases.iter().find(|db| db.name == database) else {
        error!(database = %database, "no such database in configuration");
        return EXIT_VALIDATION_ERROR;
    };

    let store = match ArchiveStore::new(&config.storage, config.defaults.retry) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot initialize object store");
            return 7;
        }
    };
    let password = match AtticConfig::resolve_env(&db_config.password_env) {
        Ok(password) => password,
        Err(e) => {
            error!("{e}");
            return EXIT_VALIDATION_ERROR;
        }
    };
    let pool = match attic_db::SourcePool::connect(db_config, &password).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(error = %e, "cannot connect to target database");
            return 7;
        }
    };

    let id = TableId::new(&database, &schema, &table);
    let prefix = config.storage.prefix.clone();
    let engine = RestoreEngine::new(store.clone(), pool, prefix.clone(), options);
    match audited_restore(&engine, store, prefix, &id).await {
        Ok(report) => {
            info!(
                objects = report.objects_restored,
                records = report.records_restored,
                skipped = report.records_skipped,
                "restore complete"
            );
            0
        }
        Err(e) => {
            error!("{e}");
            2
        }
    }
}

async fn validate_archive(
    config_path: PathBuf,
    database: String,
    schema: String,
    table: String,
) -> i32 {
    let config = match AtticConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return EXIT_VALIDATION_ERROR;
        }
    };
    let store = match ArchiveStore::new(&config.storage, config.defaults.retry) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot initialize object store");
            return 7;
        }
    };
    let id = TableId::new(&database, &schema, &table);
    match validate::validate_table_archive(&store, config.storage.prefix.as_deref(), &id).await {
        Ok(report) if report.mismatched == 0 => {
            info!(
                objects = report.checked,
                "all archived objects verified"
            );
            0
        }
        Ok(report) => {
            error!(
                mismatched = report.mismatched,
                checked = report.checked,
                "archive validation found corrupt objects"
            );
            2
        }
        Err(e) => {
            error!("{e}");
            2
        }
    }
}
