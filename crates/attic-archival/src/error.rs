// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use attic_db::DbError;
use attic_storage::StorageError;
use attic_util::retry::ErrorClass;

use crate::types::TableId;

/// Structured context carried by every pipeline error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub table: Option<TableId>,
    pub batch_ordinal: Option<u64>,
    pub fingerprint: Option<String>,
    pub phase: Option<&'static str>,
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "{table}")?;
        }
        if let Some(ordinal) = self.batch_ordinal {
            write!(f, " batch {ordinal}")?;
        }
        if let Some(phase) = self.phase {
            write!(f, " [{phase}]")?;
        }
        if let Some(fp) = &self.fingerprint {
            write!(f, " fp={}", &fp[..fp.len().min(12)])?;
        }
        Ok(())
    }
}

/// The error taxonomy of the whole engine. Severity drives handling:
/// fatals stop the run before side effects, table errors isolate one
/// table, batch errors stay inside the retry budget unless permanent.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Configuration invalid, store unreachable at startup, encryption
    /// required but disabled.
    #[error("fatal: {message}")]
    Fatal { message: String },

    /// The current table cannot continue; others are unaffected.
    #[error("table error{context}: {message}")]
    Table {
        context: ErrorContext,
        message: String,
    },

    /// Rolled back and retryable within the batch retry budget.
    #[error("transient batch error{context}: {source}")]
    BatchTransient {
        context: ErrorContext,
        #[source]
        source: anyhow::Error,
    },

    /// Verification failed: count, checksum or key-set mismatch. Rolled
    /// back and promoted to a table error; a critical alert is emitted.
    #[error("permanent batch error{context}: {message}")]
    BatchPermanent {
        context: ErrorContext,
        message: String,
    },

    /// The run-level or per-table lock could not be acquired.
    #[error("lock not acquired: {message}")]
    LockUnavailable { message: String },
}

impl ArchiveError {
    pub fn fatal(message: impl Into<String>) -> Self {
        ArchiveError::Fatal {
            message: message.into(),
        }
    }

    pub fn table(context: ErrorContext, message: impl Into<String>) -> Self {
        ArchiveError::Table {
            context,
            message: message.into(),
        }
    }

    pub fn permanent(context: ErrorContext, message: impl Into<String>) -> Self {
        ArchiveError::BatchPermanent {
            context,
            message: message.into(),
        }
    }

    pub fn transient(context: ErrorContext, source: impl Into<anyhow::Error>) -> Self {
        ArchiveError::BatchTransient {
            context,
            source: source.into(),
        }
    }

    /// Folds a database failure into the taxonomy using its own
    /// transient/permanent classification.
    pub fn from_db(context: ErrorContext, e: DbError) -> Self {
        match e.class() {
            ErrorClass::Transient => Self::transient(context, e),
            ErrorClass::Permanent => ArchiveError::Table {
                message: e.to_string(),
                context,
            },
        }
    }

    /// Folds a storage failure into the taxonomy.
    pub fn from_storage(context: ErrorContext, e: StorageError) -> Self {
        match e.class() {
            ErrorClass::Transient => Self::transient(context, e),
            ErrorClass::Permanent => ArchiveError::Table {
                message: e.to_string(),
                context,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ArchiveError::BatchTransient { .. })
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            ArchiveError::Table { context, .. }
            | ArchiveError::BatchTransient { context, .. }
            | ArchiveError::BatchPermanent { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ErrorContext {
        ErrorContext {
            table: Some(TableId::new("orders", "public", "audit_logs")),
            batch_ordinal: Some(3),
            fingerprint: Some("abcdef0123456789abcdef".to_string()),
            phase: Some("verifying"),
        }
    }

    #[test]
    fn context_renders_compactly() {
        let text = context().to_string();
        assert!(text.contains("orders.public.audit_logs"));
        assert!(text.contains("batch 3"));
        assert!(text.contains("[verifying]"));
        assert!(text.contains("fp=abcdef012345"));
    }

    #[test]
    fn classification_folds_through() {
        let transient = ArchiveError::transient(context(), anyhow::anyhow!("timeout"));
        assert!(transient.is_retryable());
        let permanent = ArchiveError::permanent(context(), "count mismatch");
        assert!(!permanent.is_retryable());
    }
}
