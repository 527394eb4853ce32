//! SQLite storage classes and row decoding.
//!
//! Decoding is driven by the runtime storage class of each value, not the
//! declared column type: SQLite lets any column hold any class, so a TEXT
//! column may well return an INTEGER.

use crate::models::{Row, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tracing::debug;

/// Logical category of a SQLite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

/// Classify an engine type name into a storage class.
///
/// Runtime values report one of `NULL`, `INTEGER`, `REAL`, `TEXT` or `BLOB`;
/// declared affinities (`BOOLEAN`, `NUMERIC`, `DATETIME`...) are folded into
/// the closest class.
pub fn classify(type_name: &str) -> StorageClass {
    let lower = type_name.to_lowercase();

    if lower == "null" {
        return StorageClass::Null;
    }

    // Integer affinity, booleans are stored as 0/1
    if lower.contains("int") || lower == "boolean" || lower == "bool" {
        return StorageClass::Integer;
    }

    if lower.contains("real")
        || lower.contains("floa")
        || lower.contains("doub")
        || lower == "numeric"
    {
        return StorageClass::Real;
    }

    if lower.contains("blob") {
        return StorageClass::Blob;
    }

    // Everything else (text, char, clob, date, time) decodes as text
    StorageClass::Text
}

/// Decode every column of a row into [`Value`]s, in column order.
pub fn decode_row(row: &SqliteRow) -> Row {
    (0..row.len()).map(|idx| decode_column(row, idx)).collect()
}

/// Names of the row's columns, in column order.
pub fn column_names(row: &SqliteRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Decode one column. Never fails: an undecodable column becomes `Null`.
pub fn decode_column(row: &SqliteRow, idx: usize) -> Value {
    let class = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => classify(raw.type_info().name()),
        Err(e) => {
            debug!(column = idx, error = %e, "Failed to read raw column value");
            return Value::Null;
        }
    };

    let decoded = match class {
        StorageClass::Null => return Value::Null,
        StorageClass::Integer => row.try_get_unchecked::<i64, _>(idx).map(Value::Integer),
        StorageClass::Real => row.try_get_unchecked::<f64, _>(idx).map(Value::Real),
        StorageClass::Text => row.try_get_unchecked::<String, _>(idx).map(Value::Text),
        StorageClass::Blob => row.try_get_unchecked::<Vec<u8>, _>(idx).map(Value::Blob),
    };

    decoded.unwrap_or_else(|e| {
        debug!(column = idx, class = ?class, error = %e, "Failed to decode column");
        Value::Null
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{Connection, Executor, SqliteConnection};

    #[test]
    fn test_classify_runtime_names() {
        assert_eq!(classify("NULL"), StorageClass::Null);
        assert_eq!(classify("INTEGER"), StorageClass::Integer);
        assert_eq!(classify("REAL"), StorageClass::Real);
        assert_eq!(classify("TEXT"), StorageClass::Text);
        assert_eq!(classify("BLOB"), StorageClass::Blob);
    }

    #[test]
    fn test_classify_declared_affinities() {
        assert_eq!(classify("BIGINT"), StorageClass::Integer);
        assert_eq!(classify("BOOLEAN"), StorageClass::Integer);
        assert_eq!(classify("DOUBLE PRECISION"), StorageClass::Real);
        assert_eq!(classify("NUMERIC"), StorageClass::Real);
        assert_eq!(classify("VARCHAR(20)"), StorageClass::Text);
        assert_eq!(classify("DATETIME"), StorageClass::Text);
    }

    #[tokio::test]
    async fn test_decode_row_uses_runtime_class() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        conn.execute("CREATE TABLE t (a TEXT, b INTEGER, c REAL, d BLOB, e TEXT)")
            .await
            .unwrap();
        // non-numeric text in an INTEGER column keeps the TEXT class
        conn.execute("INSERT INTO t VALUES ('x', 'y', 1.5, x'01ff', NULL)")
            .await
            .unwrap();

        let row = sqlx::query("SELECT a, b, c, d, e, 7 FROM t")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        let values = decode_row(&row);

        assert_eq!(
            values,
            vec![
                Value::Text("x".into()),
                Value::Text("y".into()),
                Value::Real(1.5),
                Value::Blob(vec![0x01, 0xff]),
                Value::Null,
                Value::Integer(7),
            ]
        );
    }
}
