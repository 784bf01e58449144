// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The object-store key layout. Bit-exact for compatibility: readers,
//! restores and external tooling all address objects through these
//! functions.

use chrono::{DateTime, Utc};
use object_store::path::Path;

use crate::types::TableId;

pub const WATERMARK_FILE: &str = "_watermark.json";
pub const TABLE_MANIFEST_FILE: &str = "_manifest.json";
pub const RESTORE_WATERMARK_FILE: &str = "_restore_watermark.json";
pub const CHECKPOINT_FILE: &str = "_checkpoint.json";
pub const DATA_SUFFIX: &str = "jsonl.gz";

fn prefixed(prefix: Option<&str>, rest: String) -> Path {
    match prefix {
        Some(p) if !p.is_empty() => Path::from(format!("{}/{rest}", p.trim_end_matches('/'))),
        _ => Path::from(rest),
    }
}

/// `<prefix>/<database>/<schema>/<table>/`
fn table_root(prefix: Option<&str>, table: &TableId) -> String {
    let base = format!("{}/{}/{}", table.database, table.schema, table.table);
    match prefix {
        Some(p) if !p.is_empty() => format!("{}/{base}", p.trim_end_matches('/')),
        _ => base,
    }
}

pub fn table_prefix(prefix: Option<&str>, table: &TableId) -> Path {
    Path::from(table_root(prefix, table))
}

fn date_partition(at: DateTime<Utc>) -> String {
    at.format("year=%Y/month=%m/day=%d").to_string()
}

fn batch_stem(table: &TableId, started_at: DateTime<Utc>, ordinal: u64) -> String {
    format!(
        "{}_{}_batch_{:03}",
        table.table,
        started_at.format("%Y%m%dT%H%M%SZ"),
        ordinal
    )
}

/// `<table>_YYYYMMDDTHHMMSSZ_batch_NNN.jsonl.gz` under the UTC date
/// partition of the archive execution time.
pub fn data_key(
    prefix: Option<&str>,
    table: &TableId,
    started_at: DateTime<Utc>,
    ordinal: u64,
) -> Path {
    Path::from(format!(
        "{}/{}/{}.{DATA_SUFFIX}",
        table_root(prefix, table),
        date_partition(started_at),
        batch_stem(table, started_at, ordinal)
    ))
}

pub fn metadata_key(
    prefix: Option<&str>,
    table: &TableId,
    started_at: DateTime<Utc>,
    ordinal: u64,
) -> Path {
    Path::from(format!(
        "{}/{}/{}_metadata.json",
        table_root(prefix, table),
        date_partition(started_at),
        batch_stem(table, started_at, ordinal)
    ))
}

pub fn deletion_manifest_key(
    prefix: Option<&str>,
    table: &TableId,
    started_at: DateTime<Utc>,
    ordinal: u64,
) -> Path {
    Path::from(format!(
        "{}/{}/{}_manifest.json",
        table_root(prefix, table),
        date_partition(started_at),
        batch_stem(table, started_at, ordinal)
    ))
}

pub fn watermark_key(prefix: Option<&str>, table: &TableId) -> Path {
    Path::from(format!("{}/{WATERMARK_FILE}", table_root(prefix, table)))
}

pub fn table_manifest_key(prefix: Option<&str>, table: &TableId) -> Path {
    Path::from(format!("{}/{TABLE_MANIFEST_FILE}", table_root(prefix, table)))
}

pub fn restore_watermark_key(prefix: Option<&str>, table: &TableId) -> Path {
    Path::from(format!(
        "{}/{RESTORE_WATERMARK_FILE}",
        table_root(prefix, table)
    ))
}

pub fn checkpoint_key(prefix: Option<&str>, table: &TableId) -> Path {
    Path::from(format!("{}/{CHECKPOINT_FILE}", table_root(prefix, table)))
}

/// `<prefix>/audit/year=YYYY/month=MM/day=DD/<epoch>_<kind>.json`
/// The epoch is in microseconds so bursts of events (batch skip
/// replays) cannot collide on a key.
pub fn audit_key(prefix: Option<&str>, at: DateTime<Utc>, kind: &str) -> Path {
    prefixed(
        prefix,
        format!(
            "audit/{}/{}_{kind}.json",
            date_partition(at),
            at.timestamp_micros()
        ),
    )
}

/// `<prefix>/audit/.../report_<run_id>.json`, the end-of-run summary.
pub fn run_report_key(prefix: Option<&str>, at: DateTime<Utc>, run_id: &str) -> Path {
    prefixed(
        prefix,
        format!("audit/{}/report_{run_id}.json", date_partition(at)),
    )
}

/// Lease objects for the object-store lock backend.
pub fn lock_key(prefix: Option<&str>, name: &str) -> Path {
    prefixed(prefix, format!("_locks/{name}.json"))
}
