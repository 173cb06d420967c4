//! Database layer for Lectern

mod conflict_repository;
mod connection;
mod cursor_repository;
mod meta_repository;
mod migrations;
mod oplog_repository;
mod record_repository;

pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub use connection::Database;
pub use cursor_repository::{CursorRepository, LibSqlCursorRepository};
pub use meta_repository::{LibSqlMetaRepository, MetaRepository};
pub use oplog_repository::{LibSqlOperationLogRepository, OperationCounts, OperationLogRepository};
pub use record_repository::{LibSqlRecordRepository, RecordQuery, RecordRepository};

use std::fmt::Display;
use std::str::FromStr;

use libsql::{Connection, Row, Value};

use crate::error::{Error, Result};

/// Bind an optional value, mapping `None` to SQL NULL
pub(crate) fn nullable<T: Into<Value>>(value: Option<T>) -> Value {
    value.map_or(Value::Null, Into::into)
}

pub(crate) fn opt_i64(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected integer in column {idx}, found {other:?}"
        ))),
    }
}

pub(crate) fn opt_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected text in column {idx}, found {other:?}"
        ))),
    }
}

/// Parse a stored text column into a typed value
pub(crate) fn parse_column<T>(raw: &str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| Error::Database(format!("invalid {column} '{raw}': {e}")))
}

/// Commit if `result` is ok, roll back otherwise.
///
/// Pairs with a preceding `BEGIN IMMEDIATE` on the same connection.
pub(crate) async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}
