//! Connection and transaction state models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DbError;

/// Which handle of a connection pair a statement should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// The read handle, falling back to the write handle when none exists.
    Read,
    #[default]
    Write,
}

impl FromStr for AccessMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" | "r" => Ok(Self::Read),
            "write" | "w" => Ok(Self::Write),
            _ => Err(DbError::validation(format!("Invalid access mode: '{}'", s))),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Information about an open connection pair.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Canonical path of the database
    pub path: String,
    /// Every alias currently bound to `path`, sorted
    pub aliases: Vec<String>,
    pub has_read_handle: bool,
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Constructed but not yet begun
    Created,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction has ended (committed or rolled back).
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Observable result of a transaction.
///
/// `InProgress` until the transaction exits, then exactly one of
/// `Succeeded` or `Failed` for the rest of its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    InProgress,
    Succeeded,
    Failed,
}

impl TransactionOutcome {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: String,
    pub path: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub state: TransactionState,
    pub outcome: TransactionOutcome,
    pub autocommit: bool,
    /// Open savepoints, outermost first
    pub savepoints: Vec<String>,
}
