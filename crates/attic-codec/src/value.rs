// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Sentinel distinguishing base64-encoded binary payloads from genuine
/// text values in the archived JSON.
pub const BYTES_SENTINEL: &str = "base64:";

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cannot decode archived value for type {pg_type}: {detail}")]
    Decode { pg_type: String, detail: String },
}

/// A single fetched column value, typed at the adapter boundary so the
/// JSON encoding is fixed per type rather than inferred per row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    /// Arbitrary-precision numeric, kept as the exact digits the server
    /// returned.
    Numeric(String),
    Bytes(Vec<u8>),
    /// Timezone-naive timestamp; emitted in UTC with a `Z` suffix.
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Json(Value),
    Array(Vec<ColumnValue>),
    /// Range, composite, domain and other types without a native JSON
    /// shape: the server's text form plus the canonical type name.
    Other { pg_type: String, text: String },
}

/// A primary-key value. Restricted to the scalar key types the archiver
/// supports; ordering matches the database's ordering for these types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PkValue {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl PkValue {
    pub fn to_canonical_string(&self) -> String {
        match self {
            PkValue::Int(v) => v.to_string(),
            PkValue::Text(v) => v.clone(),
            PkValue::Uuid(v) => v.to_string(),
        }
    }

    pub fn from_json(value: &Value) -> Option<PkValue> {
        match value {
            Value::Number(n) => n.as_i64().map(PkValue::Int),
            Value::String(s) => match Uuid::parse_str(s) {
                Ok(u) => Some(PkValue::Uuid(u)),
                Err(_) => Some(PkValue::Text(s.clone())),
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for PkValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_canonical_string())
    }
}

fn format_naive_utc(ts: &NaiveDateTime) -> String {
    format!("{}Z", ts.format("%Y-%m-%dT%H:%M:%S%.6f"))
}

impl ColumnValue {
    /// The fixed JSON encoding of this value. Reproducible across
    /// implementations: integers, booleans, text and UUIDs map to native
    /// JSON; numerics stay strings; binary becomes sentinel-prefixed
    /// base64; timestamps are ISO-8601 with offset (naive values get a
    /// `Z` suffix); nested documents stay nested.
    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Bool(v) => json!(v),
            ColumnValue::Int(v) => json!(v),
            ColumnValue::Float(v) => {
                if v.is_finite() {
                    json!(v)
                } else {
                    json!(v.to_string())
                }
            }
            ColumnValue::Text(v) => json!(v),
            ColumnValue::Uuid(v) => json!(v.to_string()),
            ColumnValue::Numeric(v) => json!(v),
            ColumnValue::Bytes(v) => json!(format!("{BYTES_SENTINEL}{}", BASE64.encode(v))),
            ColumnValue::Timestamp(v) => json!(format_naive_utc(v)),
            ColumnValue::TimestampTz(v) => json!(v.to_rfc3339_opts(SecondsFormat::AutoSi, false)),
            ColumnValue::Date(v) => json!(v.format("%Y-%m-%d").to_string()),
            ColumnValue::Time(v) => json!(v.format("%H:%M:%S%.6f").to_string()),
            ColumnValue::Json(v) => v.clone(),
            ColumnValue::Array(items) => {
                Value::Array(items.iter().map(ColumnValue::to_json).collect())
            }
            ColumnValue::Other { pg_type, text } => json!({
                "type": pg_type,
                "value": text,
            }),
        }
    }

    /// Inverts [`to_json`] given the canonical column type recorded in
    /// the batch metadata.
    pub fn from_json(value: &Value, pg_type: &str) -> Result<ColumnValue, ValueError> {
        if value.is_null() {
            return Ok(ColumnValue::Null);
        }
        let decode_err = |detail: &str| ValueError::Decode {
            pg_type: pg_type.to_string(),
            detail: detail.to_string(),
        };
        let base = pg_type.trim_end_matches("[]");
        if pg_type.ends_with("[]") {
            let items = value.as_array().ok_or_else(|| decode_err("expected array"))?;
            return items
                .iter()
                .map(|item| ColumnValue::from_json(item, base))
                .collect::<Result<Vec<_>, _>>()
                .map(ColumnValue::Array);
        }
        match base {
            "boolean" => value
                .as_bool()
                .map(ColumnValue::Bool)
                .ok_or_else(|| decode_err("expected boolean")),
            "smallint" | "integer" | "bigint" => value
                .as_i64()
                .map(ColumnValue::Int)
                .ok_or_else(|| decode_err("expected integer")),
            "real" | "double precision" => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(ColumnValue::Float)
                    .ok_or_else(|| decode_err("expected float")),
                Value::String(s) => s
                    .parse::<f64>()
                    .map(ColumnValue::Float)
                    .map_err(|_| decode_err("expected float")),
                _ => Err(decode_err("expected float")),
            },
            "numeric" => value
                .as_str()
                .map(|s| ColumnValue::Numeric(s.to_string()))
                .ok_or_else(|| decode_err("expected numeric string")),
            "uuid" => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(ColumnValue::Uuid)
                .ok_or_else(|| decode_err("expected uuid string")),
            "bytea" => {
                let s = value.as_str().ok_or_else(|| decode_err("expected string"))?;
                let b64 = s.strip_prefix(BYTES_SENTINEL).unwrap_or(s);
                BASE64
                    .decode(b64)
                    .map(ColumnValue::Bytes)
                    .map_err(|_| decode_err("invalid base64"))
            }
            "timestamp without time zone" => {
                let s = value.as_str().ok_or_else(|| decode_err("expected string"))?;
                NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
                    .map(ColumnValue::Timestamp)
                    .map_err(|e| decode_err(&e.to_string()))
            }
            "timestamp with time zone" => {
                let s = value.as_str().ok_or_else(|| decode_err("expected string"))?;
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| ColumnValue::TimestampTz(dt.with_timezone(&Utc)))
                    .map_err(|e| decode_err(&e.to_string()))
            }
            "date" => {
                let s = value.as_str().ok_or_else(|| decode_err("expected string"))?;
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(ColumnValue::Date)
                    .map_err(|e| decode_err(&e.to_string()))
            }
            "time without time zone" => {
                let s = value.as_str().ok_or_else(|| decode_err("expected string"))?;
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .map(ColumnValue::Time)
                    .map_err(|e| decode_err(&e.to_string()))
            }
            "json" | "jsonb" => Ok(ColumnValue::Json(value.clone())),
            "text" | "character varying" | "character" | "name" => value
                .as_str()
                .map(|s| ColumnValue::Text(s.to_string()))
                .ok_or_else(|| decode_err("expected string")),
            _ => match value {
                Value::Object(map) => {
                    let text = map
                        .get("value")
                        .and_then(Value::as_str)
                        .ok_or_else(|| decode_err("expected {type, value} object"))?;
                    Ok(ColumnValue::Other {
                        pg_type: pg_type.to_string(),
                        text: text.to_string(),
                    })
                }
                Value::String(s) => Ok(ColumnValue::Other {
                    pg_type: pg_type.to_string(),
                    text: s.clone(),
                }),
                other => Err(decode_err(&format!("unexpected JSON shape: {other}"))),
            },
        }
    }

    /// The Postgres text form used when loading restored rows back with a
    /// server-side `CAST($n AS <type>)`. `None` is SQL NULL.
    pub fn to_pg_text(&self) -> Option<String> {
        match self {
            ColumnValue::Null => None,
            ColumnValue::Bool(v) => Some(v.to_string()),
            ColumnValue::Int(v) => Some(v.to_string()),
            ColumnValue::Float(v) => Some(v.to_string()),
            ColumnValue::Text(v) => Some(v.clone()),
            ColumnValue::Uuid(v) => Some(v.to_string()),
            ColumnValue::Numeric(v) => Some(v.clone()),
            ColumnValue::Bytes(v) => Some(format!("\\x{}", hex::encode(v))),
            ColumnValue::Timestamp(v) => Some(format_naive_utc(v)),
            ColumnValue::TimestampTz(v) => {
                Some(v.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            }
            ColumnValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            ColumnValue::Time(v) => Some(v.format("%H:%M:%S%.6f").to_string()),
            ColumnValue::Json(v) => Some(v.to_string()),
            ColumnValue::Array(items) => Some(pg_array_literal(items)),
            ColumnValue::Other { text, .. } => Some(text.clone()),
        }
    }
}

/// Renders a Postgres array literal (`{a,b,NULL}`) with standard
/// backslash/quote escaping of elements.
fn pg_array_literal(items: &[ColumnValue]) -> String {
    let rendered: Vec<String> = items
        .iter()
        .map(|item| match item.to_pg_text() {
            None => "NULL".to_string(),
            Some(text) => {
                let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            }
        })
        .collect();
    format!("{{{}}}", rendered.join(","))
}
