// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed configuration for the archiver. The surface is a closed set of
//! options with explicit defaults; validation runs before any side
//! effect, and every secret is indirected through an `*_env` field
//! naming an environment variable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use attic_storage::ObjectStoreConfig;
use attic_util::retry::RetryPolicy;

pub mod compliance;
pub mod database;

pub use compliance::{ComplianceConfig, LegalHoldSourceConfig, RetentionBounds};
pub use database::{DatabaseConfig, TableConfig, VacuumMode};

pub const HARD_PARALLELISM_CAP: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("environment variable {0} is required but not set")]
    MissingEnv(String),
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

/// The deletion semantics of a run. Only verify-then-delete is
/// implemented; the enum keeps the staged alternative expressible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionMode {
    #[default]
    VerifyThenDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BatchDefaults {
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Target per-fetch duration steering the adaptive sizer.
    pub target_fetch_secs: f64,
    /// Hard floor under which the sizer never aims.
    pub fetch_floor_secs: f64,
    /// Cap on the estimated in-memory batch footprint.
    pub memory_cap_bytes: u64,
    pub retention_days: u32,
    pub checkpoint_every_batches: u64,
    pub compression_level: u32,
    pub retry: RetryPolicy,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            min_batch_size: 1_000,
            max_batch_size: 50_000,
            target_fetch_secs: 2.0,
            fetch_floor_secs: 0.1,
            memory_cap_bytes: 512 * 1024 * 1024,
            retention_days: 90,
            checkpoint_every_batches: 10,
            compression_level: 6,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LockBackend {
    /// Lock file on a shared filesystem.
    File,
    /// Postgres advisory lock on the source database.
    #[default]
    Advisory,
    /// Conditional-put lease object in the object store.
    Lease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub ttl_secs: u64,
    pub heartbeat_secs: u64,
    /// Lock file location for the `file` backend.
    pub file_path: Option<PathBuf>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            ttl_secs: 120 * 60,
            heartbeat_secs: 30,
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RunConfig {
    /// Databases processed concurrently. 1 means sequential.
    pub parallel_databases: usize,
    /// Wall-clock deadline after which no new table starts.
    pub run_deadline_secs: Option<u64>,
    /// Wall-clock budget for a single batch.
    pub batch_timeout_secs: u64,
    /// How long a graceful shutdown waits for in-flight tables.
    pub grace_period_secs: u64,
    pub deletion_mode: DeletionMode,
    pub dry_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel_databases: 1,
            run_deadline_secs: None,
            batch_timeout_secs: 3_600,
            grace_period_secs: 30,
            deletion_mode: DeletionMode::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:9184".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AtticConfig {
    pub storage: ObjectStoreConfig,
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub defaults: BatchDefaults,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub locking: LockConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AtticConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AtticConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves an `*_env` indirection. Missing variables are validation
    /// errors, surfaced before any side effect.
    pub fn resolve_env(var: &str) -> Result<String, ConfigError> {
        std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = vec![];

        if self.databases.is_empty() {
            problems.push("at least one database must be configured".to_string());
        }
        for db in &self.databases {
            db.validate(&mut problems);
            for table in &db.tables {
                let retention = table.retention_days.unwrap_or(self.defaults.retention_days);
                if let Err(detail) = self.compliance.retention_bounds.check(
                    retention,
                    table.classification.as_deref(),
                ) {
                    problems.push(format!(
                        "{}.{}.{}: {detail}",
                        db.name, table.schema, table.table
                    ));
                }
                if table.critical
                    && self.compliance.require_encryption_for_critical
                    && self.storage.sse == attic_storage::SseOption::None
                {
                    problems.push(format!(
                        "{}.{}.{} is critical but storage-side encryption is disabled",
                        db.name, table.schema, table.table
                    ));
                }
                if let Some(batch) = table.batch_size {
                    if batch < self.defaults.min_batch_size
                        || batch > self.defaults.max_batch_size
                    {
                        problems.push(format!(
                            "{}.{}.{}: batch-size {batch} outside [{}, {}]",
                            db.name,
                            table.schema,
                            table.table,
                            self.defaults.min_batch_size,
                            self.defaults.max_batch_size
                        ));
                    }
                }
            }
            // Secrets must resolve before we open any connection.
            if let Err(e) = Self::resolve_env(&db.password_env) {
                problems.push(e.to_string());
            }
        }

        if self.defaults.min_batch_size > self.defaults.max_batch_size {
            problems.push("defaults: min-batch-size exceeds max-batch-size".to_string());
        }
        if !(1..=9).contains(&self.defaults.compression_level) {
            problems.push("defaults: compression-level must be within 1..=9".to_string());
        }
        if self.defaults.target_fetch_secs < self.defaults.fetch_floor_secs {
            problems.push("defaults: target-fetch-secs below the hard floor".to_string());
        }

        if self.locking.ttl_secs < 2 * self.locking.heartbeat_secs {
            problems.push("locking: ttl-secs must be at least twice heartbeat-secs".to_string());
        }
        if self.locking.backend == LockBackend::File && self.locking.file_path.is_none() {
            problems.push("locking: file backend requires file-path".to_string());
        }

        if self.run.parallel_databases == 0 {
            problems.push("run: parallel-databases must be at least 1".to_string());
        }
        if self.run.parallel_databases > HARD_PARALLELISM_CAP {
            problems.push(format!(
                "run: parallel-databases exceeds the hard cap of {HARD_PARALLELISM_CAP}"
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    /// Effective per-table retention with defaults applied.
    pub fn retention_days_for(&self, table: &TableConfig) -> u32 {
        table.retention_days.unwrap_or(self.defaults.retention_days)
    }

    /// Effective starting batch size for a table.
    pub fn batch_size_for(&self, table: &TableConfig) -> usize {
        table.batch_size.unwrap_or(self.defaults.batch_size)
    }

    /// Classification labels mentioned anywhere, for metric label spaces.
    pub fn classifications(&self) -> Vec<String> {
        let mut set: BTreeMap<String, ()> = BTreeMap::new();
        for db in &self.databases {
            for table in &db.tables {
                if let Some(c) = &table.classification {
                    set.insert(c.clone(), ());
                }
            }
        }
        set.into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> String {
        r#"
storage:
  object-store: File
  directory: /tmp/attic-archive
databases:
  - name: orders
    host: localhost
    user: archiver
    password-env: ATTIC_TEST_DB_PASSWORD
    dbname: orders
    tables:
      - table: audit_logs
        timestamp-column: created_at
        primary-key-column: id
        retention-days: 90
"#
        .to_string()
    }

    fn parse(yaml: &str) -> AtticConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        std::env::set_var("ATTIC_TEST_DB_PASSWORD", "sekrit");
        let config = parse(&minimal_yaml());
        config.validate().unwrap();
        assert_eq!(config.databases.len(), 1);
        let table = &config.databases[0].tables[0];
        assert_eq!(table.schema, "public");
        assert_eq!(config.retention_days_for(table), 90);
        assert_eq!(config.batch_size_for(table), 1_000);
    }

    #[test]
    fn missing_password_env_fails_validation() {
        let mut config = parse(&minimal_yaml());
        config.databases[0].password_env = "ATTIC_TEST_UNSET_PASSWORD".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ATTIC_TEST_UNSET_PASSWORD"));
    }

    #[test]
    fn retention_outside_bounds_is_rejected() {
        std::env::set_var("ATTIC_TEST_DB_PASSWORD", "sekrit");
        let mut config = parse(&minimal_yaml());
        config.compliance.retention_bounds.min_days = 30;
        config.compliance.retention_bounds.max_days = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retention"));
    }

    #[test]
    fn critical_table_requires_encryption() {
        std::env::set_var("ATTIC_TEST_DB_PASSWORD", "sekrit");
        let mut config = parse(&minimal_yaml());
        config.databases[0].tables[0].critical = true;
        config.storage.sse = attic_storage::SseOption::None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("encryption"));
    }

    #[test]
    fn lock_ttl_must_cover_two_heartbeats() {
        std::env::set_var("ATTIC_TEST_DB_PASSWORD", "sekrit");
        let mut config = parse(&minimal_yaml());
        config.locking.ttl_secs = 45;
        config.locking.heartbeat_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parallelism_hard_cap_is_enforced() {
        std::env::set_var("ATTIC_TEST_DB_PASSWORD", "sekrit");
        let mut config = parse(&minimal_yaml());
        config.run.parallel_databases = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        std::env::set_var("ATTIC_TEST_DB_PASSWORD", "sekrit");
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("attic.yaml");
        std::fs::write(&path, minimal_yaml()).unwrap();
        let config = AtticConfig::load(&path).unwrap();
        assert_eq!(config.databases[0].name, "orders");
    }
}
