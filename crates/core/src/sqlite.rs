//! Connection helpers shared by the SQLite-backed stores.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;

/// Busy timeout used when a store is opened without an explicit one.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open a file-backed database in WAL mode so several connections (and
/// processes) can share it. Writers that find the database locked wait up to
/// `busy_timeout` before failing with `SQLITE_BUSY`.
pub(crate) fn open_file(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Open a private in-memory database.
pub(crate) fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Parse an RFC 3339 timestamp column, falling back to now for malformed data.
pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse an optional RFC 3339 timestamp column.
pub(crate) fn parse_optional_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.map(|v| parse_timestamp(&v))
}

/// Deserialize a JSON text column, reporting failures as a column conversion error.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    value: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a text column through `FromStr`, reporting failures as a column conversion error.
pub(crate) fn enum_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// True when the error is SQLite reporting a locked or busy database.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// True when the error is a constraint violation (unique key, foreign key, ...).
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
