// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid SQL identifier: {0:?}")]
pub struct InvalidIdentifier(pub String);

/// Quotes a SQL identifier for interpolation into dynamically-built
/// statements. Data values are always bound as parameters; identifiers
/// (schema, table, column names from configuration or introspection)
/// cannot be bound, so they pass through here instead.
///
/// Embedded double quotes are doubled per the SQL standard. NUL bytes and
/// empty identifiers are rejected outright.
pub fn quote_ident(name: &str) -> Result<String, InvalidIdentifier> {
    if name.is_empty() || name.len() > 128 || name.contains('\0') {
        return Err(InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `"schema"."table"` form used by every dynamically-built statement.
pub fn qualified_table(schema: &str, table: &str) -> Result<String, InvalidIdentifier> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}
