// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Batch verification: three-way counts, key-set equality, upload head
//! checks, and the post-commit random-sample absence probe. Any
//! mismatch is a permanent batch error: rolled back, never retried.

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use tracing::{debug, error};

use attic_codec::PkValue;

use crate::error::{ArchiveError, ErrorContext};

/// The three independently-derived record counts of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCounts {
    /// Rows matching the batch key set in the database, counted inside
    /// the batch transaction.
    pub n_db: u64,
    /// Records emitted by the serializer.
    pub n_stream: u64,
    /// Lines in the stored object, derived from the same stream that
    /// produced the object and its digest.
    pub n_object: u64,
}

pub fn verify_counts(counts: BatchCounts, context: &ErrorContext) -> Result<(), ArchiveError> {
    if counts.n_db == counts.n_stream && counts.n_stream == counts.n_object {
        debug!(n = counts.n_db, "batch counts agree");
        return Ok(());
    }
    error!(
        n_db = counts.n_db,
        n_stream = counts.n_stream,
        n_object = counts.n_object,
        "batch count mismatch"
    );
    Err(ArchiveError::permanent(
        context.clone(),
        format!(
            "count mismatch: db={} stream={} object={}",
            counts.n_db, counts.n_stream, counts.n_object
        ),
    ))
}

/// The key set leaving through the serializer must equal the key set
/// passed to the delete.
pub fn verify_key_sets(
    serialized: &[PkValue],
    to_delete: &[PkValue],
    context: &ErrorContext,
) -> Result<(), ArchiveError> {
    let a: BTreeSet<&PkValue> = serialized.iter().collect();
    let b: BTreeSet<&PkValue> = to_delete.iter().collect();
    if a == b {
        return Ok(());
    }
    let missing: Vec<_> = a.difference(&b).take(5).collect();
    let extra: Vec<_> = b.difference(&a).take(5).collect();
    Err(ArchiveError::permanent(
        context.clone(),
        format!(
            "primary-key set mismatch: {} serialized vs {} to delete \
             (sample missing={missing:?} extra={extra:?})",
            a.len(),
            b.len()
        ),
    ))
}

/// The stored object must exist and match the serialized compressed
/// length byte for byte.
pub fn verify_upload_size(
    reported_size: u64,
    expected_size: u64,
    context: &ErrorContext,
) -> Result<(), ArchiveError> {
    if reported_size == expected_size {
        return Ok(());
    }
    Err(ArchiveError::permanent(
        context.clone(),
        format!("stored object is {reported_size} bytes, expected {expected_size}"),
    ))
}

/// Delete must touch exactly the batch's rows.
pub fn verify_affected_rows(
    affected: u64,
    expected: u64,
    context: &ErrorContext,
) -> Result<(), ArchiveError> {
    if affected == expected {
        return Ok(());
    }
    Err(ArchiveError::permanent(
        context.clone(),
        format!("delete affected {affected} rows, expected {expected}"),
    ))
}

/// Sample size for the post-commit absence probe:
/// `min(1000, max(10, 1% of batch))`, capped at the batch itself.
pub fn sample_size(batch_len: usize) -> usize {
    let one_percent = batch_len / 100;
    one_percent.clamp(10, 1_000).min(batch_len)
}

/// Chooses the keys to probe after commit.
pub fn choose_sample(keys: &[PkValue]) -> Vec<PkValue> {
    let n = sample_size(keys.len());
    let mut rng = rand::thread_rng();
    keys.choose_multiple(&mut rng, n).cloned().collect()
}
