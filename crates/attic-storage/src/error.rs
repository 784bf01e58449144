// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use attic_util::retry::ErrorClass;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("circuit breaker is open for the object store endpoint")]
    CircuitOpen,

    #[error("conditional write conflict on {key}")]
    PreconditionFailed { key: String },

    #[error("object {key} already exists")]
    AlreadyExists { key: String },

    #[error("payload for {key} parked in local fallback at {path}")]
    ParkedToFallback { key: String, path: String },

    #[error("multipart upload state invalid for {key}: {detail}")]
    MultipartState { key: String, detail: String },

    #[error("fallback directory unavailable: {0}")]
    Fallback(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::Store(object_store::Error::NotFound { .. })
        )
    }

    /// Retry classification shared with the retry primitive. Conditional
    /// write conflicts and missing objects are program states, not
    /// transport failures, so they never retry blindly.
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Store(object_store::Error::NotFound { .. })
            | StorageError::Store(object_store::Error::AlreadyExists { .. })
            | StorageError::Store(object_store::Error::Precondition { .. })
            | StorageError::Store(object_store::Error::NotImplemented)
            | StorageError::PreconditionFailed { .. }
            | StorageError::AlreadyExists { .. }
            | StorageError::MultipartState { .. } => ErrorClass::Permanent,
            StorageError::CircuitOpen => ErrorClass::Transient,
            StorageError::ParkedToFallback { .. } => ErrorClass::Transient,
            StorageError::Fallback(_) => ErrorClass::Permanent,
            StorageError::Store(_) => ErrorClass::Transient,
        }
    }
}
