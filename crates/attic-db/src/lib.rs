// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Source-database access: one pool per logical database, schema
//! introspection with drift hashes, and the locking batch reads and
//! key-set deletes the pipeline is built from. All data flows through
//! bound parameters; identifiers go through strict quoting.

use std::time::Duration;

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use tokio_postgres::NoTls;
use tracing::debug;

use attic_config::DatabaseConfig;

pub mod error;
pub mod introspect;
pub mod row;
pub mod source;

pub use error::DbError;
pub use introspect::{ColumnInfo, IndexInfo, TableSchema};
pub use source::{FetchedRow, TableOps};

pub type ConnectionPool = Pool<PostgresConnectionManager<NoTls>>;
pub type PoolConnection<'a> = bb8::PooledConnection<'a, PostgresConnectionManager<NoTls>>;

/// Maximum tolerated difference between archiver and server clocks when
/// computing cutoffs.
pub const MAX_CLOCK_SKEW_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy)]
struct SessionSettings {
    statement_timeout: Duration,
}

#[async_trait::async_trait]
impl bb8::CustomizeConnection<tokio_postgres::Client, tokio_postgres::Error> for SessionSettings {
    async fn on_acquire(&self, conn: &mut tokio_postgres::Client) -> Result<(), tokio_postgres::Error> {
        conn.batch_execute(&format!(
            "SET statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .await
    }
}

/// Connection pool for one logical source database.
pub struct SourcePool {
    pool: ConnectionPool,
    name: String,
}

impl SourcePool {
    pub async fn connect(config: &DatabaseConfig, password: &str) -> Result<Self, DbError> {
        let manager = PostgresConnectionManager::new_from_stringlike(
            config.connection_string(password),
            NoTls,
        )?;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(30))
            .connection_customizer(Box::new(SessionSettings {
                statement_timeout: Duration::from_secs(config.statement_timeout_secs),
            }))
            .build(manager)
            .await?;
        Ok(Self {
            pool,
            name: config.name.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Result<PoolConnection<'_>, DbError> {
        Ok(self.pool.get().await?)
    }

    /// Cheap liveness probe used before handing connections to the
    /// pipeline and by the health endpoint.
    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.get().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    /// The server's clock, which cutoff computation trusts over the
    /// archiver's own.
    pub async fn server_now(&self) -> Result<DateTime<Utc>, DbError> {
        let conn = self.get().await?;
        let row = conn.query_one("SELECT now()", &[]).await?;
        Ok(row.get::<_, DateTime<Utc>>(0))
    }

    /// Server time, aborting if archiver/server skew is past the bound.
    pub async fn server_now_checked(&self) -> Result<DateTime<Utc>, DbError> {
        let server = self.server_now().await?;
        let skew = (server - Utc::now()).num_milliseconds().abs() as f64 / 1000.0;
        if skew > MAX_CLOCK_SKEW_SECS {
            return Err(DbError::ClockSkew {
                skew_secs: skew,
                max_secs: MAX_CLOCK_SKEW_SECS,
            });
        }
        debug!(database = %self.name, skew_secs = skew, "clock skew within bounds");
        Ok(server)
    }

    /// The server's version string, recorded in batch metadata.
    pub async fn server_version(&self) -> Result<String, DbError> {
        let conn = self.get().await?;
        let row = conn.query_one("SELECT version()", &[]).await?;
        Ok(row.get(0))
    }

    /// Session-scoped advisory lock on a dedicated connection. The
    /// returned client must stay alive for as long as the lock is held.
    pub async fn advisory_lock_connection(&self) -> Result<tokio_postgres::Client, DbError> {
        Ok(self.pool.dedicated_connection().await?)
    }

    pub fn state(&self) -> bb8::State {
        self.pool.state()
    }
}

/// Stable 64-bit key for `pg_advisory_lock`, derived from a lock name.
pub fn advisory_key(name: &str) -> i64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(name.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_stable_and_distinct() {
        let a = advisory_key("attic/orders");
        let b = advisory_key("attic/orders");
        let c = advisory_key("attic/billing");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
