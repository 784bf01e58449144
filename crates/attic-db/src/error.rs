// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use attic_util::ident::InvalidIdentifier;
use attic_util::retry::ErrorClass;
use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("{0}")]
    Ident(#[from] InvalidIdentifier),

    #[error("table {schema}.{table} not found during introspection")]
    TableNotFound { schema: String, table: String },

    #[error("column {column} not found on {schema}.{table}")]
    ColumnNotFound {
        schema: String,
        table: String,
        column: String,
    },

    #[error("primary key column {column} has unsupported type {pg_type}")]
    UnsupportedKeyType { column: String, pg_type: String },

    #[error("clock skew between archiver and server is {skew_secs:.1}s, above the allowed {max_secs:.1}s")]
    ClockSkew { skew_secs: f64, max_secs: f64 },

    #[error("vacuum timed out after {timeout_secs}s")]
    VacuumTimeout { timeout_secs: u64 },
}

impl<E: std::fmt::Debug> From<bb8::RunError<E>> for DbError {
    fn from(e: bb8::RunError<E>) -> Self {
        DbError::Pool(format!("{e:?}"))
    }
}

impl DbError {
    /// Maps database failures onto the shared retry taxonomy. Deadlocks,
    /// timeouts and connection drops retry; authentication, missing
    /// objects and type errors do not.
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::Pool(_) => ErrorClass::Transient,
            DbError::ClockSkew { .. } => ErrorClass::Permanent,
            DbError::Ident(_)
            | DbError::TableNotFound { .. }
            | DbError::ColumnNotFound { .. }
            | DbError::UnsupportedKeyType { .. } => ErrorClass::Permanent,
            DbError::VacuumTimeout { .. } => ErrorClass::Transient,
            DbError::Postgres(e) => match e.code() {
                Some(code) => {
                    const TRANSIENT: &[SqlState] = &[
                        SqlState::T_R_DEADLOCK_DETECTED,
                        SqlState::T_R_SERIALIZATION_FAILURE,
                        SqlState::QUERY_CANCELED,
                        SqlState::CONNECTION_EXCEPTION,
                        SqlState::CONNECTION_FAILURE,
                        SqlState::CONNECTION_DOES_NOT_EXIST,
                        SqlState::TOO_MANY_CONNECTIONS,
                        SqlState::ADMIN_SHUTDOWN,
                        SqlState::CRASH_SHUTDOWN,
                    ];
                    const PERMANENT: &[SqlState] = &[
                        SqlState::INVALID_PASSWORD,
                        SqlState::INVALID_AUTHORIZATION_SPECIFICATION,
                        SqlState::INSUFFICIENT_PRIVILEGE,
                        SqlState::UNDEFINED_TABLE,
                        SqlState::UNDEFINED_COLUMN,
                        SqlState::DATATYPE_MISMATCH,
                        SqlState::INVALID_TEXT_REPRESENTATION,
                        SqlState::SYNTAX_ERROR,
                    ];
                    if TRANSIENT.contains(code) {
                        ErrorClass::Transient
                    } else if PERMANENT.contains(code) {
                        ErrorClass::Permanent
                    } else {
                        ErrorClass::Transient
                    }
                }
                // No SQLSTATE usually means the connection itself broke.
                None => ErrorClass::Transient,
            },
        }
    }
}
