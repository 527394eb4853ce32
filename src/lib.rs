//! Async SQLite Manager
//!
//! Manages many SQLite databases from one process: a registry of read/write
//! connection pairs addressed by path or alias, parameterized queries with
//! per-column type conversion, transactions with observable outcomes, and
//! per-database reader/writer locks and serial write queues.

pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod logging;
pub mod manager;
pub mod models;

pub use config::ManagerConfig;
pub use db::{QueuedWrite, ShutdownMode, Transaction, WriteOp, write_op};
pub use error::{DbError, DbResult};
pub use history::{BufferedHistory, HistoryBuffer, HistoryEntry, HistoryRecorder, HistorySink};
pub use manager::Manager;
