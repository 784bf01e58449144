// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

fn default_schema() -> String {
    "public".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_pool_size() -> u32 {
    5
}

fn default_statement_timeout_secs() -> u64 {
    30 * 60
}

/// Post-table maintenance strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VacuumMode {
    None,
    #[default]
    Analyze,
    Standard,
    Full,
}

/// One archivable table. Frozen for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    /// Monotonic timestamp column driving the archival cursor.
    pub timestamp_column: String,
    /// Scalar unique key column; the second component of the cursor.
    pub primary_key_column: String,
    #[serde(default)]
    pub retention_days: Option<u32>,
    /// Data classification label (drives per-class retention bounds).
    #[serde(default)]
    pub classification: Option<String>,
    /// Critical tables demand storage-side encryption.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_batches_per_run: Option<u64>,
    #[serde(default)]
    pub vacuum_mode: VacuumMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    /// Logical name, used in object keys and metrics labels.
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Name of the environment variable holding the password.
    pub password_env: String,
    pub dbname: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl DatabaseConfig {
    /// Connection string with the password spliced in from its
    /// environment indirection.
    pub fn connection_string(&self, password: &str) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, password, self.dbname
        )
    }

    pub(crate) fn validate(&self, problems: &mut Vec<String>) {
        if self.name.is_empty() {
            problems.push("database name must not be empty".to_string());
        }
        if self.tables.is_empty() {
            problems.push(format!("database {}: no tables configured", self.name));
        }
        if self.pool_size == 0 {
            problems.push(format!("database {}: pool-size must be at least 1", self.name));
        }
        for table in &self.tables {
            for (field, value) in [
                ("table", &table.table),
                ("schema", &table.schema),
                ("timestamp-column", &table.timestamp_column),
                ("primary-key-column", &table.primary_key_column),
            ] {
                if attic_util::ident::quote_ident(value).is_err() {
                    problems.push(format!(
                        "database {}: table {}: invalid {field} {value:?}",
                        self.name, table.table
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let yaml = r#"
name: orders
host: db.internal
user: archiver
password-env: PW
dbname: orders
tables:
  - table: audit_logs
    timestamp-column: created_at
    primary-key-column: id
"#;
        let db: DatabaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(db.port, 5432);
        assert_eq!(db.pool_size, 5);
        assert_eq!(db.statement_timeout_secs, 1800);
        assert_eq!(db.tables[0].schema, "public");
        assert_eq!(db.tables[0].vacuum_mode, VacuumMode::Analyze);
        assert!(!db.tables[0].critical);
    }

    #[test]
    fn connection_string_contains_resolved_password() {
        let db = DatabaseConfig {
            name: "orders".into(),
            host: "localhost".into(),
            port: 5433,
            user: "archiver".into(),
            password_env: "PW".into(),
            dbname: "orders".into(),
            pool_size: 5,
            statement_timeout_secs: 1800,
            tables: vec![],
        };
        let conn = db.connection_string("hunter2");
        assert!(conn.contains("port=5433"));
        assert!(conn.contains("password=hunter2"));
    }

    #[test]
    fn invalid_identifier_is_reported() {
        let mut problems = vec![];
        let db = DatabaseConfig {
            name: "orders".into(),
            host: "localhost".into(),
            port: 5432,
            user: "archiver".into(),
            password_env: "PW".into(),
            dbname: "orders".into(),
            pool_size: 5,
            statement_timeout_secs: 1800,
            tables: vec![TableConfig {
                schema: "public".into(),
                table: "bad\0name".into(),
                timestamp_column: "created_at".into(),
                primary_key_column: "id".into(),
                retention_days: None,
                classification: None,
                critical: false,
                batch_size: None,
                max_batches_per_run: None,
                vacuum_mode: VacuumMode::default(),
            }],
        };
        db.validate(&mut problems);
        assert_eq!(problems.len(), 1);
    }
}
