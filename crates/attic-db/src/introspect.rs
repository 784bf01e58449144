// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_postgres::GenericClient;

use crate::DbError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Canonical type name (`bigint`, `timestamp with time zone`,
    /// `integer[]`, …) used for drift hashing and restore casts.
    pub data_type: String,
    pub nullable: bool,
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
}

/// Snapshot of a table's shape, taken once per table run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexInfo>,
}

impl TableSchema {
    pub async fn introspect<C: GenericClient>(
        client: &C,
        schema: &str,
        table: &str,
    ) -> Result<TableSchema, DbError> {
        let columns = client
            .query(
                "SELECT column_name, data_type, udt_name, is_nullable, ordinal_position::int4 \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await?
            .into_iter()
            .map(|row| {
                let data_type: String = row.get(1);
                let udt_name: String = row.get(2);
                let nullable: String = row.get(3);
                ColumnInfo {
                    name: row.get(0),
                    data_type: canonical_type(&data_type, &udt_name),
                    nullable: nullable == "YES",
                    ordinal: row.get(4),
                }
            })
            .collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(DbError::TableNotFound {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }

        let primary_key = client
            .query(
                "SELECT a.attname \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary \
                 ORDER BY array_position(i.indkey::int2[], a.attnum)",
                &[&schema, &table],
            )
            .await?
            .into_iter()
            .map(|row| row.get(0))
            .collect();

        let indexes = client
            .query(
                "SELECT indexname, indexdef FROM pg_indexes \
                 WHERE schemaname = $1 AND tablename = $2 ORDER BY indexname",
                &[&schema, &table],
            )
            .await?
            .into_iter()
            .map(|row| IndexInfo {
                name: row.get(0),
                definition: row.get(1),
            })
            .collect();

        Ok(TableSchema {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
            primary_key,
            indexes,
        })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Canonical hash used for drift detection: stable across index
    /// order, sensitive to column names, types, nullability and the
    /// primary key.
    pub fn canonical_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for column in &self.columns {
            hasher.update(column.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(column.data_type.as_bytes());
            hasher.update(b"\0");
            hasher.update(if column.nullable { b"1" } else { b"0" });
            hasher.update(b"\n");
        }
        hasher.update(self.primary_key.join(",").as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Normalizes `information_schema` typing into one canonical name.
/// Arrays surface as `ARRAY` + a `_`-prefixed element `udt_name`;
/// user-defined types surface as `USER-DEFINED`.
pub fn canonical_type(data_type: &str, udt_name: &str) -> String {
    match data_type {
        "ARRAY" => format!("{}[]", element_type(udt_name)),
        "USER-DEFINED" => udt_name.to_string(),
        other => other.to_string(),
    }
}

fn element_type(udt_name: &str) -> String {
    let element = udt_name.strip_prefix('_').unwrap_or(udt_name);
    match element {
        "int2" => "smallint",
        "int4" => "integer",
        "int8" => "bigint",
        "float4" => "real",
        "float8" => "double precision",
        "bool" => "boolean",
        "varchar" => "character varying",
        "bpchar" => "character",
        "timestamptz" => "timestamp with time zone",
        "timestamp" => "timestamp without time zone",
        other => other,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> TableSchema {
        TableSchema {
            schema: "public".into(),
            table: "audit_logs".into(),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "bigint".into(),
                    nullable: false,
                    ordinal: 1,
                },
                ColumnInfo {
                    name: "created_at".into(),
                    data_type: "timestamp with time zone".into(),
                    nullable: false,
                    ordinal: 2,
                },
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
        }
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(sample_schema().canonical_hash(), sample_schema().canonical_hash());
    }

    #[test]
    fn hash_changes_with_type_drift() {
        let mut drifted = sample_schema();
        drifted.columns[0].data_type = "integer".into();
        assert_ne!(sample_schema().canonical_hash(), drifted.canonical_hash());
    }

    #[test]
    fn hash_ignores_index_churn() {
        let mut with_index = sample_schema();
        with_index.indexes.push(IndexInfo {
            name: "idx".into(),
            definition: "CREATE INDEX idx ON audit_logs (created_at)".into(),
        });
        assert_eq!(sample_schema().canonical_hash(), with_index.canonical_hash());
    }

    #[test]
    fn canonical_types_cover_arrays_and_udts() {
        assert_eq!(canonical_type("ARRAY", "_int8"), "bigint[]");
        assert_eq!(canonical_type("ARRAY", "_varchar"), "character varying[]");
        assert_eq!(canonical_type("USER-DEFINED", "mood"), "mood");
        assert_eq!(canonical_type("numeric", "numeric"), "numeric");
    }
}
