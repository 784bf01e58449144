// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;
use tracing::{debug, warn};

use attic_codec::{ColumnValue, PkValue};
use attic_config::VacuumMode;
use attic_util::ident::{qualified_table, quote_ident};

use crate::introspect::TableSchema;
use crate::row::{decode_value, select_list};
use crate::DbError;

/// Supported scalar primary-key kinds. Fixed at table start from the
/// introspected type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkKind {
    Int,
    Text,
    Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsKind {
    /// `timestamp without time zone`; values are interpreted as UTC.
    Naive,
    /// `timestamp with time zone`.
    Aware,
}

/// One fetched row, with the cursor components pulled out.
#[derive(Debug, Clone)]
pub struct FetchedRow {
    pub columns: Vec<(String, ColumnValue)>,
    pub ts: DateTime<Utc>,
    pub pk: PkValue,
}

/// The dynamically-built, parameter-bound statements for one table.
#[derive(Debug)]
pub struct TableOps {
    pub schema: TableSchema,
    qualified: String,
    select_list: String,
    ts_ident: String,
    pk_ident: String,
    pub ts_kind: TsKind,
    pub pk_kind: PkKind,
    ts_column: String,
    pk_column: String,
}

impl TableOps {
    pub fn new(schema: TableSchema, ts_column: &str, pk_column: &str) -> Result<Self, DbError> {
        let ts_info = schema.column(ts_column).ok_or_else(|| DbError::ColumnNotFound {
            schema: schema.schema.clone(),
            table: schema.table.clone(),
            column: ts_column.to_string(),
        })?;
        let ts_kind = match ts_info.data_type.as_str() {
            "timestamp with time zone" => TsKind::Aware,
            "timestamp without time zone" => TsKind::Naive,
            other => {
                return Err(DbError::UnsupportedKeyType {
                    column: ts_column.to_string(),
                    pg_type: other.to_string(),
                })
            }
        };
        let pk_info = schema.column(pk_column).ok_or_else(|| DbError::ColumnNotFound {
            schema: schema.schema.clone(),
            table: schema.table.clone(),
            column: pk_column.to_string(),
        })?;
        let pk_kind = match pk_info.data_type.as_str() {
            "smallint" | "integer" | "bigint" => PkKind::Int,
            "text" | "character varying" => PkKind::Text,
            "uuid" => PkKind::Uuid,
            other => {
                return Err(DbError::UnsupportedKeyType {
                    column: pk_column.to_string(),
                    pg_type: other.to_string(),
                })
            }
        };

        Ok(Self {
            qualified: qualified_table(&schema.schema, &schema.table)?,
            select_list: select_list(&schema.columns)?,
            ts_ident: quote_ident(ts_column)?,
            pk_ident: quote_ident(pk_column)?,
            ts_kind,
            pk_kind,
            ts_column: ts_column.to_string(),
            pk_column: pk_column.to_string(),
            schema,
        })
    }

    fn ts_param<'a>(
        &self,
        ts: &'a DateTime<Utc>,
        naive_buf: &'a mut Option<chrono::NaiveDateTime>,
    ) -> &'a (dyn ToSql + Sync) {
        match self.ts_kind {
            TsKind::Aware => ts,
            TsKind::Naive => {
                *naive_buf = Some(ts.naive_utc());
                naive_buf.as_ref().unwrap()
            }
        }
    }

    /// Rows eligible under the cutoff, for progress reporting and the
    /// zero-work fast path.
    pub async fn count_eligible<C: GenericClient>(
        &self,
        client: &C,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} < $1",
            self.qualified, self.ts_ident
        );
        let mut naive_buf = None;
        let row = client
            .query_one(&sql, &[self.ts_param(&cutoff, &mut naive_buf)])
            .await?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    /// The locking batch select: strict `<` cutoff, lexicographic
    /// `(ts, pk)` cursor, `FOR UPDATE SKIP LOCKED`, never OFFSET.
    /// `exclude` narrows the candidate set for record-level legal holds;
    /// it comes from the hold source, not from user data.
    pub async fn fetch_batch<C: GenericClient>(
        &self,
        client: &C,
        cutoff: DateTime<Utc>,
        cursor: Option<(DateTime<Utc>, PkValue)>,
        limit: i64,
        exclude: Option<&str>,
    ) -> Result<Vec<FetchedRow>, DbError> {
        let hold_clause = exclude
            .map(|predicate| format!(" AND NOT ({predicate})"))
            .unwrap_or_default();

        let mut cutoff_naive = None;
        let mut lo_naive = None;
        let pk_int;
        let pk_text;
        let pk_uuid;
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![];

        let sql = match &cursor {
            None => {
                params.push(self.ts_param(&cutoff, &mut cutoff_naive));
                params.push(&limit);
                format!(
                    "SELECT {} FROM {} WHERE {} < $1{hold_clause} \
                     ORDER BY {}, {} LIMIT $2 FOR UPDATE SKIP LOCKED",
                    self.select_list, self.qualified, self.ts_ident, self.ts_ident, self.pk_ident
                )
            }
            Some((lo_ts, lo_pk)) => {
                params.push(self.ts_param(&cutoff, &mut cutoff_naive));
                params.push(self.ts_param(lo_ts, &mut lo_naive));
                match lo_pk {
                    PkValue::Int(v) => {
                        pk_int = *v;
                        params.push(&pk_int);
                    }
                    PkValue::Text(v) => {
                        pk_text = v.clone();
                        params.push(&pk_text);
                    }
                    PkValue::Uuid(v) => {
                        pk_uuid = *v;
                        params.push(&pk_uuid);
                    }
                }
                params.push(&limit);
                format!(
                    "SELECT {} FROM {} WHERE {} < $1 \
                     AND ({} > $2 OR ({} = $2 AND {} > $3)){hold_clause} \
                     ORDER BY {}, {} LIMIT $4 FOR UPDATE SKIP LOCKED",
                    self.select_list,
                    self.qualified,
                    self.ts_ident,
                    self.ts_ident,
                    self.ts_ident,
                    self.pk_ident,
                    self.ts_ident,
                    self.pk_ident
                )
            }
        };

        let rows = client.query(&sql, &params).await?;
        debug!(table = %self.qualified, fetched = rows.len(), "batch selected");

        let mut fetched = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut columns = Vec::with_capacity(self.schema.columns.len());
            for (idx, info) in self.schema.columns.iter().enumerate() {
                columns.push((info.name.clone(), decode_value(row, idx, &info.data_type)?));
            }
            let ts = match columns
                .iter()
                .find(|(name, _)| *name == self.ts_column)
                .map(|(_, v)| v)
            {
                Some(ColumnValue::TimestampTz(ts)) => *ts,
                Some(ColumnValue::Timestamp(naive)) => naive.and_utc(),
                other => {
                    return Err(DbError::UnsupportedKeyType {
                        column: self.ts_column.clone(),
                        pg_type: format!("{other:?}"),
                    })
                }
            };
            let pk = match columns
                .iter()
                .find(|(name, _)| *name == self.pk_column)
                .map(|(_, v)| v)
            {
                Some(ColumnValue::Int(v)) => PkValue::Int(*v),
                Some(ColumnValue::Text(v)) => PkValue::Text(v.clone()),
                Some(ColumnValue::Uuid(v)) => PkValue::Uuid(*v),
                other => {
                    return Err(DbError::UnsupportedKeyType {
                        column: self.pk_column.clone(),
                        pg_type: format!("{other:?}"),
                    })
                }
            };
            fetched.push(FetchedRow { columns, ts, pk });
        }
        Ok(fetched)
    }

    fn int_keys(keys: &[PkValue]) -> Vec<i64> {
        keys.iter()
            .filter_map(|k| match k {
                PkValue::Int(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    fn text_keys(keys: &[PkValue]) -> Vec<String> {
        keys.iter()
            .filter_map(|k| match k {
                PkValue::Text(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    fn uuid_keys(keys: &[PkValue]) -> Vec<uuid::Uuid> {
        keys.iter()
            .filter_map(|k| match k {
                PkValue::Uuid(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    async fn count_where_keys<C: GenericClient>(
        &self,
        client: &C,
        sql: &str,
        keys: &[PkValue],
    ) -> Result<Vec<tokio_postgres::Row>, DbError> {
        let rows = match self.pk_kind {
            PkKind::Int => client.query(sql, &[&Self::int_keys(keys)]).await?,
            PkKind::Text => client.query(sql, &[&Self::text_keys(keys)]).await?,
            PkKind::Uuid => client.query(sql, &[&Self::uuid_keys(keys)]).await?,
        };
        Ok(rows)
    }

    /// `n_db`: rows matching the batch's key set inside the batch
    /// transaction, where the fetch already holds their row locks.
    pub async fn count_by_keys<C: GenericClient>(
        &self,
        client: &C,
        keys: &[PkValue],
    ) -> Result<u64, DbError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ANY($1)",
            self.qualified, self.pk_ident
        );
        let rows = self.count_where_keys(client, &sql, keys).await?;
        Ok(rows[0].get::<_, i64>(0) as u64)
    }

    /// The statement text the digest in the deletion manifest is
    /// computed over.
    pub fn delete_statement(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {} = ANY($1)",
            self.qualified, self.pk_ident
        )
    }

    /// Deletes exactly the fetched key set. Returns rows affected.
    pub async fn delete_by_keys<C: GenericClient>(
        &self,
        client: &C,
        keys: &[PkValue],
    ) -> Result<u64, DbError> {
        let sql = self.delete_statement();
        let affected = match self.pk_kind {
            PkKind::Int => client.execute(&sql, &[&Self::int_keys(keys)]).await?,
            PkKind::Text => client.execute(&sql, &[&Self::text_keys(keys)]).await?,
            PkKind::Uuid => client.execute(&sql, &[&Self::uuid_keys(keys)]).await?,
        };
        Ok(affected)
    }

    /// Which of `keys` still exist, for the post-commit sample absence
    /// check. Any survivor is a critical signal.
    pub async fn present_keys<C: GenericClient>(
        &self,
        client: &C,
        keys: &[PkValue],
    ) -> Result<Vec<PkValue>, DbError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ANY($1)",
            self.pk_ident, self.qualified, self.pk_ident
        );
        let rows = self.count_where_keys(client, &sql, keys).await?;
        let mut present = Vec::with_capacity(rows.len());
        for row in rows {
            present.push(match self.pk_kind {
                PkKind::Int => PkValue::Int(row.get::<_, i64>(0)),
                PkKind::Text => PkValue::Text(row.get(0)),
                PkKind::Uuid => PkValue::Uuid(row.get(0)),
            });
        }
        Ok(present)
    }

    /// On-disk footprint of the table, for measuring what a vacuum
    /// reclaimed.
    pub async fn relation_size<C: GenericClient>(&self, client: &C) -> Result<i64, DbError> {
        let row = client
            .query_one("SELECT pg_total_relation_size($1::regclass)", &[&self.qualified])
            .await?;
        Ok(row.get(0))
    }

    /// Post-table maintenance. Runs outside any transaction, bounded by
    /// `timeout`; an overrun is reported but the caller treats it as
    /// non-fatal.
    pub async fn vacuum(
        &self,
        client: &tokio_postgres::Client,
        mode: VacuumMode,
        timeout: Duration,
    ) -> Result<(), DbError> {
        let sql = match mode {
            VacuumMode::None => return Ok(()),
            VacuumMode::Analyze => format!("ANALYZE {}", self.qualified),
            VacuumMode::Standard => format!("VACUUM ANALYZE {}", self.qualified),
            VacuumMode::Full => format!("VACUUM FULL ANALYZE {}", self.qualified),
        };
        match tokio::time::timeout(timeout, client.batch_execute(&sql)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(table = %self.qualified, mode = ?mode, "vacuum timed out");
                Err(DbError::VacuumTimeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn timestamp_column(&self) -> &str {
        &self.ts_column
    }

    pub fn primary_key_column(&self) -> &str {
        &self.pk_column
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::ColumnInfo;

    fn schema(pk_type: &str, ts_type: &str) -> TableSchema {
        TableSchema {
            schema: "public".into(),
            table: "audit_logs".into(),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: pk_type.into(),
                    nullable: false,
                    ordinal: 1,
                },
                ColumnInfo {
                    name: "created_at".into(),
                    data_type: ts_type.into(),
                    nullable: false,
                    ordinal: 2,
                },
                ColumnInfo {
                    name: "amount".into(),
                    data_type: "numeric".into(),
                    nullable: true,
                    ordinal: 3,
                },
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
        }
    }

    #[test]
    fn ops_build_for_supported_key_types() {
        for pk in ["bigint", "integer", "text", "uuid"] {
            let ops =
                TableOps::new(schema(pk, "timestamp with time zone"), "created_at", "id");
            assert!(ops.is_ok(), "pk type {pk} should be supported");
        }
    }

    #[test]
    fn unsupported_key_type_is_rejected() {
        let err = TableOps::new(schema("numeric", "timestamp with time zone"), "created_at", "id")
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedKeyType { .. }));
    }

    #[test]
    fn non_timestamp_cursor_column_is_rejected() {
        let err = TableOps::new(schema("bigint", "bigint"), "created_at", "id").unwrap_err();
        assert!(matches!(err, DbError::UnsupportedKeyType { .. }));
    }

    #[test]
    fn missing_columns_are_reported() {
        let err = TableOps::new(schema("bigint", "timestamp with time zone"), "updated_at", "id")
            .unwrap_err();
        assert!(matches!(err, DbError::ColumnNotFound { .. }));
    }

    #[test]
    fn delete_statement_is_parameterized() {
        let ops =
            TableOps::new(schema("bigint", "timestamp with time zone"), "created_at", "id")
                .unwrap();
        assert_eq!(
            ops.delete_statement(),
            "DELETE FROM \"public\".\"audit_logs\" WHERE \"id\" = ANY($1)"
        );
    }
}
