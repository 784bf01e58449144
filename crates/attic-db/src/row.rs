// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio_postgres::Row;
use uuid::Uuid;

use attic_codec::ColumnValue;

use crate::introspect::ColumnInfo;
use crate::DbError;

/// Types fetched over the wire in their native binary form. Everything
/// else is cast to text in the select list and decoded against the
/// canonical type from introspection.
pub fn is_native_type(canonical: &str) -> bool {
    let base = canonical.trim_end_matches("[]");
    if canonical.ends_with("[]") {
        return matches!(
            base,
            "boolean"
                | "smallint"
                | "integer"
                | "bigint"
                | "real"
                | "double precision"
                | "text"
                | "character varying"
                | "uuid"
        );
    }
    matches!(
        base,
        "boolean"
            | "smallint"
            | "integer"
            | "bigint"
            | "real"
            | "double precision"
            | "text"
            | "character varying"
            | "character"
            | "name"
            | "bytea"
            | "date"
            | "time without time zone"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "uuid"
            | "json"
            | "jsonb"
    )
}

/// Decodes one wire value into the typed model. `canonical` is the
/// introspected type; text-cast columns arrive as TEXT regardless of it.
pub fn decode_value(row: &Row, idx: usize, canonical: &str) -> Result<ColumnValue, DbError> {
    let wire = row.columns()[idx].type_().name().to_string();
    let value = match wire.as_str() {
        "bool" => row
            .get::<_, Option<bool>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Bool),
        "int2" => row
            .get::<_, Option<i16>>(idx)
            .map_or(ColumnValue::Null, |v| ColumnValue::Int(v as i64)),
        "int4" => row
            .get::<_, Option<i32>>(idx)
            .map_or(ColumnValue::Null, |v| ColumnValue::Int(v as i64)),
        "int8" => row
            .get::<_, Option<i64>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Int),
        "float4" => row
            .get::<_, Option<f32>>(idx)
            .map_or(ColumnValue::Null, |v| ColumnValue::Float(v as f64)),
        "float8" => row
            .get::<_, Option<f64>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Float),
        "bytea" => row
            .get::<_, Option<Vec<u8>>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Bytes),
        "timestamp" => row
            .get::<_, Option<NaiveDateTime>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Timestamp),
        "timestamptz" => row
            .get::<_, Option<DateTime<Utc>>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::TimestampTz),
        "date" => row
            .get::<_, Option<NaiveDate>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Date),
        "time" => row
            .get::<_, Option<NaiveTime>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Time),
        "uuid" => row
            .get::<_, Option<Uuid>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Uuid),
        "json" | "jsonb" => row
            .get::<_, Option<serde_json::Value>>(idx)
            .map_or(ColumnValue::Null, ColumnValue::Json),
        "_bool" => array_value(row.get::<_, Option<Vec<Option<bool>>>>(idx), ColumnValue::Bool),
        "_int2" => array_value(row.get::<_, Option<Vec<Option<i16>>>>(idx), |v| {
            ColumnValue::Int(v as i64)
        }),
        "_int4" => array_value(row.get::<_, Option<Vec<Option<i32>>>>(idx), |v| {
            ColumnValue::Int(v as i64)
        }),
        "_int8" => array_value(row.get::<_, Option<Vec<Option<i64>>>>(idx), ColumnValue::Int),
        "_float4" => array_value(row.get::<_, Option<Vec<Option<f32>>>>(idx), |v| {
            ColumnValue::Float(v as f64)
        }),
        "_float8" => array_value(row.get::<_, Option<Vec<Option<f64>>>>(idx), ColumnValue::Float),
        "_text" | "_varchar" => {
            array_value(row.get::<_, Option<Vec<Option<String>>>>(idx), ColumnValue::Text)
        }
        "_uuid" => array_value(row.get::<_, Option<Vec<Option<Uuid>>>>(idx), ColumnValue::Uuid),
        // TEXT both for genuine text columns and for the cast-to-text
        // select entries covering numeric, ranges, composites, domains.
        "text" | "varchar" | "bpchar" | "name" => match row.get::<_, Option<String>>(idx) {
            None => ColumnValue::Null,
            Some(text) => match canonical {
                "text" | "character varying" | "character" | "name" => ColumnValue::Text(text),
                "numeric" => ColumnValue::Numeric(text),
                other => ColumnValue::Other {
                    pg_type: other.to_string(),
                    text,
                },
            },
        },
        other => ColumnValue::Other {
            pg_type: canonical.to_string(),
            text: format!("<unsupported wire type {other}>"),
        },
    };
    Ok(value)
}

fn array_value<T>(items: Option<Vec<Option<T>>>, f: impl Fn(T) -> ColumnValue) -> ColumnValue {
    match items {
        None => ColumnValue::Null,
        Some(items) => ColumnValue::Array(
            items
                .into_iter()
                .map(|item| item.map_or(ColumnValue::Null, &f))
                .collect(),
        ),
    }
}

/// Builds the select list for a table: native columns pass through,
/// everything else is cast to text under its own name.
pub fn select_list(columns: &[ColumnInfo]) -> Result<String, DbError> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        let quoted = attic_util::ident::quote_ident(&column.name)?;
        if is_native_type(&column.data_type) {
            parts.push(quoted);
        } else {
            parts.push(format!("{quoted}::text AS {quoted}"));
        }
    }
    Ok(parts.join(", "))
}
