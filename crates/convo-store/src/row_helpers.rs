use crate::error::StoreError;

/// Get a required column value from a row, returning `CorruptRow` on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    column: &'static str,
    table: &'static str,
) -> Result<T, StoreError> {
    row.get(column).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    column: &'static str,
    table: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, column, table)
}

/// Read a `TEXT` column and parse it into an enum.
pub fn get_enum<T: std::str::FromStr>(
    row: &rusqlite::Row<'_>,
    column: &'static str,
    table: &'static str,
) -> Result<T, StoreError> {
    let raw: String = get(row, column, table)?;
    parse_enum(&raw, table, column)
}

/// Read a nullable `TEXT` column and parse it into an enum.
pub fn get_enum_opt<T: std::str::FromStr>(
    row: &rusqlite::Row<'_>,
    column: &'static str,
    table: &'static str,
) -> Result<Option<T>, StoreError> {
    get_opt::<String>(row, column, table)?
        .map(|raw| parse_enum(&raw, table, column))
        .transpose()
}

/// Read an `INTEGER` 0/1 column as `bool`.
pub fn get_bool(
    row: &rusqlite::Row<'_>,
    column: &'static str,
    table: &'static str,
) -> Result<bool, StoreError> {
    Ok(get::<i64>(row, column, table)? != 0)
}

/// Parse a string into an enum, returning `CorruptRow` on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Parse a JSON string column, returning `CorruptRow` on failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}
