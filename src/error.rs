//! Error types for the manager.
//!
//! All fallible operations return [`DbResult`]. Variants are grouped the way
//! callers react to them: connection problems, transaction protocol
//! problems, rejected input, history recording, and engine statement errors.

use thiserror::Error;

/// SQLite primary result code for `SQLITE_BUSY`.
const SQLITE_BUSY: &str = "5";

/// SQLite primary result code for `SQLITE_LOCKED`.
const SQLITE_LOCKED: &str = "6";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Connection not found: {target}")]
    ConnectionNotFound { target: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// SQLite extended result code, e.g. "2067" for a UNIQUE violation
        code: Option<String>,
        suggestion: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("History recording failed: {message}")]
    History { message: String },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found(target: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            target: target.into(),
        }
    }

    /// Create an engine error with an optional SQLite result code.
    pub fn database(
        message: impl Into<String>,
        code: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            code,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a history recording error.
    pub fn history(message: impl Into<String>) -> Self {
        Self::History {
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// True for connection-level failures (`ConnectionFailure`).
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectionNotFound { .. })
    }

    /// Check if this error is retryable.
    ///
    /// Contention on the single writer surfaces as `SQLITE_BUSY` or
    /// `SQLITE_LOCKED`; both clear once the other writer finishes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Database { code, message, .. } => {
                let primary = code.as_deref().map(primary_code);
                matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                    || message.contains("database is locked")
            }
            _ => false,
        }
    }
}

/// Reduce an extended SQLite result code to its primary code.
fn primary_code(code: &str) -> &str {
    match code.parse::<i64>() {
        Ok(n) => match n & 0xff {
            5 => SQLITE_BUSY,
            6 => SQLITE_LOCKED,
            _ => code,
        },
        Err(_) => code,
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the database path and connection options",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database file is accessible",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check the SQLite library version",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "SQLite worker thread crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
