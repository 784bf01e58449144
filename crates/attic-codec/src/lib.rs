// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Row encoding for archived batches: typed column values, newline-
//! delimited JSON with reserved metadata fields, gzip compression, and
//! rolling SHA-256 digests over both the raw and compressed streams.

pub mod compress;
pub mod jsonl;
pub mod value;

pub use compress::FileCompression;
pub use jsonl::{JsonlDecoder, JsonlSerializer, ReservedFields, SerializedBatch};
pub use value::{ColumnValue, PkValue};

use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest over a sorted primary-key list, as stored in deletion
/// manifests. Keys are rendered in their canonical text form and joined
/// with commas before hashing.
pub fn sorted_key_digest(keys: &[PkValue]) -> String {
    let mut sorted: Vec<String> = keys.iter().map(|k| k.to_canonical_string()).collect();
    sorted.sort();
    sha256_hex(sorted.join(",").as_bytes())
}
