//! Data models for the SQLite manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use connection::{
    AccessMode, ConnectionInfo, TransactionInfo, TransactionOutcome, TransactionState,
};
pub use query::{Params, QueryOutput, QueryParam, QueryRequest, ReturnShape};
pub use value::{NamedRow, Row, TypeTag, Value};
