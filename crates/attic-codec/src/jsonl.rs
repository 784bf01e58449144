// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io::{BufRead, BufReader, Write};

use bytes::{Buf, Bytes};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::value::ColumnValue;
use crate::FileCompression;

pub const FIELD_ARCHIVED_AT: &str = "_archived_at";
pub const FIELD_BATCH_ID: &str = "_batch_id";
pub const FIELD_SOURCE_DATABASE: &str = "_source_database";
pub const FIELD_SOURCE_TABLE: &str = "_source_table";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {line} is not valid JSON: {source}")]
    BadRecord {
        line: u64,
        source: serde_json::Error,
    },
    #[error("record {line} is not a JSON object")]
    NotAnObject { line: u64 },
}

/// The four reserved fields stamped onto every archived record. Inserted
/// by the serializer, never by the source query.
#[derive(Debug, Clone)]
pub struct ReservedFields {
    pub archived_at: DateTime<Utc>,
    pub batch_id: String,
    pub source_database: String,
    pub source_table: String,
}

/// Everything the verifier needs about a finished batch object.
#[derive(Debug, Clone)]
pub struct SerializedBatch {
    pub compressed: Bytes,
    pub record_count: u64,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
    pub uncompressed_sha256: String,
    pub compressed_sha256: String,
}

/// Streams rows into gzip-compressed JSONL while keeping rolling SHA-256
/// digests of the uncompressed and compressed byte streams. One record
/// per row, newline-terminated.
pub struct JsonlSerializer {
    reserved: ReservedFields,
    encoder: GzEncoder<Vec<u8>>,
    raw_hasher: Sha256,
    record_count: u64,
    uncompressed_len: u64,
    line_buf: Vec<u8>,
}

impl JsonlSerializer {
    pub fn new(reserved: ReservedFields, compression_level: u32) -> Self {
        Self {
            reserved,
            encoder: GzEncoder::new(Vec::new(), Compression::new(compression_level)),
            raw_hasher: Sha256::new(),
            record_count: 0,
            uncompressed_len: 0,
            line_buf: Vec::with_capacity(1024),
        }
    }

    /// Appends one row. Column order is preserved; the reserved fields go
    /// last so the row's own columns lead the record.
    pub fn write_row(&mut self, columns: &[(String, ColumnValue)]) -> Result<(), CodecError> {
        let mut record = Map::with_capacity(columns.len() + 4);
        for (name, value) in columns {
            record.insert(name.clone(), value.to_json());
        }
        record.insert(
            FIELD_ARCHIVED_AT.to_string(),
            Value::String(
                self.reserved
                    .archived_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        );
        record.insert(
            FIELD_BATCH_ID.to_string(),
            Value::String(self.reserved.batch_id.clone()),
        );
        record.insert(
            FIELD_SOURCE_DATABASE.to_string(),
            Value::String(self.reserved.source_database.clone()),
        );
        record.insert(
            FIELD_SOURCE_TABLE.to_string(),
            Value::String(self.reserved.source_table.clone()),
        );

        self.line_buf.clear();
        serde_json::to_writer(&mut self.line_buf, &Value::Object(record))
            .map_err(std::io::Error::other)?;
        self.line_buf.push(b'\n');

        self.raw_hasher.update(&self.line_buf);
        self.encoder.write_all(&self.line_buf)?;
        self.uncompressed_len += self.line_buf.len() as u64;
        self.record_count += 1;
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn finish(self) -> Result<SerializedBatch, CodecError> {
        let compressed = self.encoder.finish()?;
        let compressed_sha256 = hex::encode(Sha256::digest(&compressed));
        Ok(SerializedBatch {
            compressed_len: compressed.len() as u64,
            compressed: Bytes::from(compressed),
            record_count: self.record_count,
            uncompressed_len: self.uncompressed_len,
            uncompressed_sha256: hex::encode(self.raw_hasher.finalize()),
            compressed_sha256,
        })
    }
}

/// Streaming reader over an archived data object: decompresses and yields
/// one JSON object per line.
pub struct JsonlDecoder {
    lines: std::io::Lines<BufReader<Box<dyn std::io::Read + Send>>>,
    line_no: u64,
}

impl JsonlDecoder {
    pub fn new(data: Bytes, compression: FileCompression) -> Self {
        let reader: Box<dyn std::io::Read + Send> = match compression {
            FileCompression::Gzip => Box::new(GzDecoder::new(data.reader())),
            FileCompression::None => Box::new(data.reader()),
        };
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }
}

impl Iterator for JsonlDecoder {
    type Item = Result<Map<String, Value>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(CodecError::Io(e))),
            };
            self.line_no += 1;
            if line.is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str::<Value>(&line)
                    .map_err(|source| CodecError::BadRecord {
                        line: self.line_no,
                        source,
                    })
                    .and_then(|value| match value {
                        Value::Object(map) => Ok(map),
                        _ => Err(CodecError::NotAnObject { line: self.line_no }),
                    }),
            );
        }
    }
}

/// Strips the reserved fields from a decoded record, returning them
/// separately.
pub fn split_reserved(mut record: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut reserved = Map::new();
    for key in [
        FIELD_ARCHIVED_AT,
        FIELD_BATCH_ID,
        FIELD_SOURCE_DATABASE,
        FIELD_SOURCE_TABLE,
    ] {
        if let Some(value) = record.remove(key) {
            reserved.insert(key.to_string(), value);
        }
    }
    (record, reserved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256_hex;
    use chrono::TimeZone;

    fn reserved() -> ReservedFields {
        ReservedFields {
            archived_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            batch_id: "fp-abc".to_string(),
            source_database: "orders".to_string(),
            source_table: "audit_logs".to_string(),
        }
    }

    fn sample_row(id: i64) -> Vec<(String, ColumnValue)> {
        vec![
            ("id".to_string(), ColumnValue::Int(id)),
            ("note".to_string(), ColumnValue::Text(format!("row {id}"))),
        ]
    }

    #[test]
    fn counts_and_digests_match_the_stream() {
        let mut ser = JsonlSerializer::new(reserved(), 6);
        for id in 1..=25 {
            ser.write_row(&sample_row(id)).unwrap();
        }
        let batch = ser.finish().unwrap();
        assert_eq!(batch.record_count, 25);

        let raw = FileCompression::Gzip
            .decompress(batch.compressed.clone())
            .unwrap();
        assert_eq!(raw.len() as u64, batch.uncompressed_len);
        assert_eq!(sha256_hex(&raw), batch.uncompressed_sha256);
        assert_eq!(sha256_hex(&batch.compressed), batch.compressed_sha256);
        assert_eq!(raw.iter().filter(|b| **b == b'\n').count(), 25);
    }

    #[test]
    fn decoder_yields_every_record_with_reserved_fields() {
        let mut ser = JsonlSerializer::new(reserved(), 6);
        for id in 1..=10 {
            ser.write_row(&sample_row(id)).unwrap();
        }
        let batch = ser.finish().unwrap();

        let records: Vec<_> = JsonlDecoder::new(batch.compressed, FileCompression::Gzip)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record["id"], Value::from(i as i64 + 1));
            assert_eq!(record[FIELD_BATCH_ID], "fp-abc");
            assert_eq!(record[FIELD_SOURCE_DATABASE], "orders");
            assert_eq!(record[FIELD_SOURCE_TABLE], "audit_logs");
            assert_eq!(record[FIELD_ARCHIVED_AT], "2024-06-01T00:00:00.000000Z");
        }
    }

    #[test]
    fn split_reserved_separates_row_columns() {
        let mut ser = JsonlSerializer::new(reserved(), 1);
        ser.write_row(&sample_row(7)).unwrap();
        let batch = ser.finish().unwrap();
        let record = JsonlDecoder::new(batch.compressed, FileCompression::Gzip)
            .next()
            .unwrap()
            .unwrap();
        let (row, meta) = split_reserved(record);
        assert_eq!(row.len(), 2);
        assert_eq!(meta.len(), 4);
        assert!(row.contains_key("id"));
        assert!(meta.contains_key(FIELD_BATCH_ID));
    }

    #[test]
    fn serialization_is_deterministic_for_fixed_inputs() {
        let build = || {
            let mut ser = JsonlSerializer::new(reserved(), 6);
            for id in 1..=5 {
                ser.write_row(&sample_row(id)).unwrap();
            }
            ser.finish().unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a.uncompressed_sha256, b.uncompressed_sha256);
        assert_eq!(a.compressed_sha256, b.compressed_sha256);
    }
}
