//! Database layer.
//!
//! - Connection registry with read/write handle pairs and aliases
//! - Query execution and row decoding
//! - Per-column type conversion
//! - Transaction state machine
//! - Per-path locks and write queues

pub mod convert;
pub mod coordinator;
pub mod executor;
pub(crate) mod params;
pub mod registry;
pub mod transaction;
pub mod types;
pub mod write_queue;

pub use convert::{RowConverter, build_row_converter, convert_default, convert_to};
pub use coordinator::{ConcurrencyCoordinator, PathLock, ReadGuard, WriteGuard};
pub use executor::QueryExecutor;
pub use registry::{ConnectionPair, ConnectionRegistry, DbHandle, HandleRole, PathSnapshot};
pub use transaction::{Transaction, TransactionTracker};
pub use write_queue::{QueuedWrite, ShutdownMode, WriteOp, WriteQueue, write_op};
