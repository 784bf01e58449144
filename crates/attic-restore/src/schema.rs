// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use tracing::warn;

use attic_db::{ColumnInfo, TableSchema};

use crate::{RestoreError, SchemaMigrationStrategy};

/// How archived records map onto the current table: which columns to
/// insert and the server-side cast type for each.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    /// `(column name, cast type)` in archived order.
    pub insert_columns: Vec<(String, String)>,
    /// Archived columns with no counterpart in the current table.
    pub dropped: Vec<String>,
    /// Current-table columns absent from the archive; left to their
    /// defaults on insert.
    pub defaulted: Vec<String>,
}

/// Reconciles the archived column list with the live table shape under
/// the chosen strategy.
pub fn reconcile(
    archived: &[ColumnInfo],
    current: &TableSchema,
    strategy: SchemaMigrationStrategy,
) -> Result<ColumnMapping, RestoreError> {
    let mut insert_columns = vec![];
    let mut dropped = vec![];

    for column in archived {
        match current.column(&column.name) {
            Some(live) => {
                if strategy == SchemaMigrationStrategy::Strict
                    && live.data_type != column.data_type
                {
                    return Err(RestoreError::Schema(format!(
                        "column {} changed type: archived {}, current {}",
                        column.name, column.data_type, live.data_type
                    )));
                }
                // Lenient keeps the archived value only when the type
                // still matches; transform trusts the server-side cast.
                let compatible = live.data_type == column.data_type
                    || matches!(
                        strategy,
                        SchemaMigrationStrategy::Transform | SchemaMigrationStrategy::None
                    );
                if compatible {
                    insert_columns.push((column.name.clone(), live.data_type.clone()));
                } else {
                    warn!(column = %column.name, archived = %column.data_type,
                        current = %live.data_type, "dropping type-drifted column");
                    dropped.push(column.name.clone());
                }
            }
            None => match strategy {
                SchemaMigrationStrategy::Strict => {
                    return Err(RestoreError::Schema(format!(
                        "archived column {} no longer exists",
                        column.name
                    )));
                }
                SchemaMigrationStrategy::None => {
                    insert_columns.push((column.name.clone(), column.data_type.clone()));
                }
                _ => {
                    warn!(column = %column.name, "dropping archived column unknown to the table");
                    dropped.push(column.name.clone());
                }
            },
        }
    }

    let defaulted: Vec<String> = current
        .columns
        .iter()
        .filter(|c| !archived.iter().any(|a| a.name == c.name))
        .map(|c| c.name.clone())
        .collect();
    if strategy == SchemaMigrationStrategy::Strict && !defaulted.is_empty() {
        return Err(RestoreError::Schema(format!(
            "table gained columns since archival: {defaulted:?}"
        )));
    }

    if insert_columns.is_empty() {
        return Err(RestoreError::Schema(
            "no archived columns map onto the current table".to_string(),
        ));
    }
    Ok(ColumnMapping {
        insert_columns,
        dropped,
        defaulted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            ordinal: 0,
        }
    }

    fn current(columns: Vec<ColumnInfo>) -> TableSchema {
        TableSchema {
            schema: "public".into(),
            table: "audit_logs".into(),
            columns,
            primary_key: vec!["id".into()],
            indexes: vec![],
        }
    }

    #[test]
    fn identical_shapes_pass_strict() {
        let archived = vec![column("id", "bigint"), column("note", "text")];
        let live = current(vec![column("id", "bigint"), column("note", "text")]);
        let mapping = reconcile(&archived, &live, SchemaMigrationStrategy::Strict).unwrap();
        assert_eq!(mapping.insert_columns.len(), 2);
        assert!(mapping.dropped.is_empty());
        assert!(mapping.defaulted.is_empty());
    }

    #[test]
    fn strict_rejects_any_drift() {
        let archived = vec![column("id", "bigint"), column("gone", "text")];
        let live = current(vec![column("id", "bigint")]);
        assert!(reconcile(&archived, &live, SchemaMigrationStrategy::Strict).is_err());

        let archived = vec![column("id", "integer")];
        let live = current(vec![column("id", "bigint")]);
        assert!(reconcile(&archived, &live, SchemaMigrationStrategy::Strict).is_err());

        let archived = vec![column("id", "bigint")];
        let live = current(vec![column("id", "bigint"), column("added", "text")]);
        assert!(reconcile(&archived, &live, SchemaMigrationStrategy::Strict).is_err());
    }

    #[test]
    fn lenient_drops_unknown_and_defaults_new() {
        let archived = vec![column("id", "bigint"), column("gone", "text")];
        let live = current(vec![column("id", "bigint"), column("added", "text")]);
        let mapping = reconcile(&archived, &live, SchemaMigrationStrategy::Lenient).unwrap();
        assert_eq!(mapping.insert_columns, vec![("id".to_string(), "bigint".to_string())]);
        assert_eq!(mapping.dropped, vec!["gone"]);
        assert_eq!(mapping.defaulted, vec!["added"]);
    }

    #[test]
    fn transform_casts_drifted_types() {
        let archived = vec![column("id", "integer")];
        let live = current(vec![column("id", "bigint")]);
        let mapping = reconcile(&archived, &live, SchemaMigrationStrategy::Transform).unwrap();
        assert_eq!(mapping.insert_columns, vec![("id".to_string(), "bigint".to_string())]);
    }

    #[test]
    fn lenient_drops_type_drifted_columns() {
        let archived = vec![column("id", "bigint"), column("amount", "numeric")];
        let live = current(vec![column("id", "bigint"), column("amount", "text")]);
        let mapping = reconcile(&archived, &live, SchemaMigrationStrategy::Lenient).unwrap();
        assert_eq!(mapping.insert_columns.len(), 1);
        assert_eq!(mapping.dropped, vec!["amount"]);
    }
}
