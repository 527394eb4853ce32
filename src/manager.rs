//! Manager facade.
//!
//! [`Manager`] owns the connection registry, the concurrency coordinator, the
//! transaction tracker and the query executor for one process. It is cheap to
//! clone; clones share all state.

use crate::config::ManagerConfig;
use crate::db::coordinator::{ConcurrencyCoordinator, ReadGuard, WriteGuard};
use crate::db::executor::{QueryExecutor, execute_raw};
use crate::db::registry::{ConnectionPair, ConnectionRegistry, DbHandle, PathSnapshot};
use crate::db::transaction::{Transaction, TransactionTracker, validate_savepoint_name};
use crate::db::write_queue::{QueuedWrite, ShutdownMode, WriteOp, write_op};
use crate::error::{DbError, DbResult};
use crate::history::HistoryRecorder;
use crate::models::{AccessMode, ConnectionInfo, QueryOutput, QueryRequest, TransactionInfo};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ManagerInner {
    config: ManagerConfig,
    registry: ConnectionRegistry,
    coordinator: ConcurrencyCoordinator,
    tracker: TransactionTracker,
    executor: QueryExecutor,
}

/// Entry point for connections, queries, transactions and write queues.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.inner.config)
            .field("executor", &self.inner.executor)
            .finish()
    }
}

/// What a control statement on a target applies to.
enum ControlTarget {
    Transaction(Transaction),
    Connection(ConnectionPair),
    Missing,
}

impl Manager {
    /// Create a manager without a history recorder.
    pub fn new(config: ManagerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a manager that records executed statements in `history`.
    pub fn with_history(config: ManagerConfig, history: Arc<dyn HistoryRecorder>) -> Self {
        Self::build(config, Some(history))
    }

    fn build(config: ManagerConfig, history: Option<Arc<dyn HistoryRecorder>>) -> Self {
        let executor = QueryExecutor::new(&config, history);
        let registry = ConnectionRegistry::new(&config);
        debug!(config = ?config, "Manager created");
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                coordinator: ConcurrencyCoordinator::new(),
                tracker: TransactionTracker::new(),
                executor,
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub(crate) fn coordinator(&self) -> &ConcurrencyCoordinator {
        &self.inner.coordinator
    }

    pub(crate) fn tracker(&self) -> &TransactionTracker {
        &self.inner.tracker
    }

    pub(crate) fn executor(&self) -> &QueryExecutor {
        &self.inner.executor
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Open (or reuse) the connection pair for `path`, optionally binding
    /// `alias` to it and adding a read-only handle.
    pub async fn connect(
        &self,
        path: &str,
        alias: Option<&str>,
        create_read_connection: bool,
    ) -> DbResult<ConnectionPair> {
        self.inner
            .registry
            .connect(path, alias, create_read_connection)
            .await
    }

    /// The handle for `target` in `mode`. Read mode falls back to the write
    /// handle when the pair has no read handle.
    pub async fn get_connection(&self, target: &str, mode: AccessMode) -> Option<DbHandle> {
        self.inner.registry.get(target, mode).await
    }

    pub async fn connection_info(&self, target: &str) -> Option<ConnectionInfo> {
        self.inner.registry.info(target).await
    }

    /// Snapshot of every open canonical path.
    pub async fn databases(&self) -> PathSnapshot {
        self.inner.registry.list_paths().await
    }

    /// Bind `alias` to the connection of `target`; `None` removes its aliases.
    pub async fn set_alias(&self, target: &str, alias: Option<&str>) -> DbResult<()> {
        self.inner.registry.set_alias(target, alias).await
    }

    /// Re-key the connection of `target` under `new_path`. The database file
    /// itself is not moved.
    pub async fn rename_path(&self, target: &str, new_path: &str) -> DbResult<String> {
        let old = self
            .inner
            .registry
            .resolve(target)
            .await
            .ok_or_else(|| DbError::connection_not_found(target))?;
        let new = self.inner.registry.rename_path(target, new_path).await?;
        self.inner.coordinator.rename(&old, &new).await;
        self.inner.tracker.rename(&old, &new);
        Ok(new)
    }

    /// Close the connection of `target`.
    ///
    /// An active transaction on it is marked rolled back, then its write
    /// queue is drained. Returns `false` if nothing was open.
    pub async fn close(&self, target: &str) -> DbResult<bool> {
        let Some(path) = self.inner.registry.resolve(target).await else {
            debug!(target = %target, "Close requested for unknown connection");
            return Ok(false);
        };
        if let Some(transaction) = self.inner.tracker.current(&path) {
            transaction.invalidate().await;
        }
        self.inner.coordinator.forget(&path).await;
        self.inner.registry.close(&path).await
    }

    /// Close every connection. Failures are logged and returned, not raised.
    pub async fn close_all(&self) -> Vec<(String, DbError)> {
        for transaction in self.inner.tracker.list() {
            transaction.invalidate().await;
        }
        self.inner.coordinator.forget_all().await;
        let failures = self.inner.registry.close_all().await;
        for (path, error) in &failures {
            warn!(path = %path, error = %error, "Failed to close connection");
        }
        failures
    }

    /// Close everything and flush the history recorder.
    pub async fn shutdown(&self) -> DbResult<()> {
        let failures = self.close_all().await;
        self.inner.executor.flush_history().await?;
        info!(close_failures = failures.len(), "Manager shut down");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Execute a request against `target`.
    ///
    /// An unknown target yields [`QueryOutput::NoConnection`], or
    /// `ConnectionNotFound` when the request is strict. Afterwards the open
    /// transaction of the path is committed when the request or the
    /// manager's autocommit policy asks for it.
    pub async fn execute(&self, target: &str, request: QueryRequest) -> DbResult<QueryOutput> {
        let Some(pair) = self.inner.registry.get_pair(target).await else {
            if request.strict {
                return Err(DbError::connection_not_found(target));
            }
            debug!(target = %target, sql = %request.sql, "No connection, statement skipped");
            return Ok(QueryOutput::NoConnection);
        };

        let handle = pair.handle(request.mode).clone();
        let output = {
            let mut conn = handle.acquire().await?;
            self.inner
                .executor
                .execute(&mut conn, pair.path(), &request)
                .await?
        };

        if self
            .inner
            .executor
            .should_commit(request.commit, request.override_autocommit)
        {
            self.commit(pair.path()).await?;
        }
        Ok(output)
    }

    /// Queue a request on the write queue of `target`.
    ///
    /// Queued statements run outside the commit policy: each is durable on
    /// completion unless a transaction is open on the path.
    pub async fn enqueue(&self, target: &str, request: QueryRequest) -> DbResult<QueuedWrite> {
        let pair = self.require_pair(target).await?;
        let executor = self.inner.executor.clone();
        let path = pair.path().to_string();
        let op = write_op(move |conn| {
            Box::pin(async move { executor.execute(conn, &path, &request).await })
        });
        self.submit(&pair, op).await
    }

    /// Queue an arbitrary operation on the write queue of `target`.
    pub async fn enqueue_with(&self, target: &str, op: WriteOp) -> DbResult<QueuedWrite> {
        let pair = self.require_pair(target).await?;
        self.submit(&pair, op).await
    }

    async fn submit(&self, pair: &ConnectionPair, op: WriteOp) -> DbResult<QueuedWrite> {
        let queue = self
            .inner
            .coordinator
            .queue(pair.path(), pair.write_handle())
            .await;
        queue.submit(op)
    }

    /// Stop the write queue of `target`. Returns `false` if it had none.
    pub async fn shutdown_queue(&self, target: &str, mode: ShutdownMode) -> DbResult<bool> {
        let path = self.require_path(target).await?;
        Ok(self.inner.coordinator.shutdown_queue(&path, mode).await)
    }

    async fn require_pair(&self, target: &str) -> DbResult<ConnectionPair> {
        self.inner
            .registry
            .get_pair(target)
            .await
            .ok_or_else(|| DbError::connection_not_found(target))
    }

    async fn require_path(&self, target: &str) -> DbResult<String> {
        self.inner
            .registry
            .resolve(target)
            .await
            .ok_or_else(|| DbError::connection_not_found(target))
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Enter a shared read section on `target`. Read sections run together
    /// and exclude safe transactions and queued writes.
    ///
    /// Awaiting a queued write on the same path while holding the section
    /// deadlocks.
    pub async fn read_section(&self, target: &str) -> DbResult<ReadGuard> {
        let path = self.require_path(target).await?;
        self.inner.coordinator.read_section(&path).await
    }

    /// Enter an exclusive section on `target`.
    pub async fn exclusive_section(&self, target: &str) -> DbResult<WriteGuard> {
        let path = self.require_path(target).await?;
        self.inner.coordinator.exclusive_section(&path).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// A new transaction on `target`, not yet begun.
    pub fn transaction(&self, target: &str, autocommit: bool) -> Transaction {
        Transaction::new(self.clone(), target, autocommit, false)
    }

    /// A new autocommit transaction that holds the exclusive section of its
    /// path from begin to exit.
    pub fn safe_transaction(&self, target: &str) -> Transaction {
        Transaction::new(self.clone(), target, true, true)
    }

    /// Run `body` in a transaction on `target`.
    pub async fn with_transaction<F, T, E>(
        &self,
        target: &str,
        autocommit: bool,
        body: F,
    ) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: From<DbError>,
    {
        self.transaction(target, autocommit).scope(body).await
    }

    /// Run `body` in a safe transaction on `target`.
    pub async fn with_safe_transaction<F, T, E>(&self, target: &str, body: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: From<DbError>,
    {
        self.safe_transaction(target).scope(body).await
    }

    /// The active transaction on `target`, if any.
    pub async fn current_transaction(&self, target: &str) -> Option<Transaction> {
        let path = self.inner.registry.resolve(target).await?;
        self.inner.tracker.current(&path)
    }

    /// Every active transaction.
    pub fn transactions(&self) -> Vec<TransactionInfo> {
        self.inner
            .tracker
            .list()
            .iter()
            .map(Transaction::info)
            .collect()
    }

    async fn control_target(&self, target: &str) -> ControlTarget {
        let Some(pair) = self.inner.registry.get_pair(target).await else {
            return ControlTarget::Missing;
        };
        match self.inner.tracker.current(pair.path()) {
            Some(transaction) => ControlTarget::Transaction(transaction),
            None => ControlTarget::Connection(pair),
        }
    }

    /// Commit the open transaction of `target`.
    ///
    /// Without a tracked transaction this commits whatever engine transaction
    /// the write handle holds (one opened by a facade savepoint, say), and
    /// does nothing when there is none.
    pub async fn commit(&self, target: &str) -> DbResult<()> {
        match self.control_target(target).await {
            ControlTarget::Transaction(transaction) => transaction.commit().await,
            ControlTarget::Connection(pair) => self.end_untracked(&pair, "COMMIT").await,
            ControlTarget::Missing => Ok(()),
        }
    }

    /// Roll back the open transaction of `target`, tracked or not. A no-op
    /// without one.
    pub async fn rollback(&self, target: &str) -> DbResult<()> {
        match self.control_target(target).await {
            ControlTarget::Transaction(transaction) => transaction.rollback().await,
            ControlTarget::Connection(pair) => self.end_untracked(&pair, "ROLLBACK").await,
            ControlTarget::Missing => Ok(()),
        }
    }

    /// COMMIT or ROLLBACK on a write handle with no tracked transaction.
    async fn end_untracked(&self, pair: &ConnectionPair, statement: &str) -> DbResult<()> {
        let mut conn = pair.write_handle().acquire().await?;
        // A transaction may have begun while the connection was being acquired.
        if let Some(transaction) = self.inner.tracker.current(pair.path()) {
            drop(conn);
            return match statement {
                "COMMIT" => transaction.commit().await,
                _ => transaction.rollback().await,
            };
        }
        match execute_raw(&mut conn, statement).await {
            Ok(()) => {
                drop(conn);
                debug!(path = %pair.path(), sql = %statement, "Control statement executed");
                self.inner
                    .executor
                    .record_control(pair.path(), statement)
                    .await;
                Ok(())
            }
            Err(e) if is_no_transaction(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a savepoint on `target`, in its open transaction if any.
    pub async fn savepoint(&self, target: &str, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        match self.control_target(target).await {
            ControlTarget::Transaction(transaction) => transaction.savepoint(name).await,
            ControlTarget::Connection(pair) => {
                run_control(&pair, &format!("SAVEPOINT {}", name)).await
            }
            ControlTarget::Missing => Ok(()),
        }
    }

    /// Roll back to a savepoint on `target`.
    pub async fn rollback_to(&self, target: &str, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        match self.control_target(target).await {
            ControlTarget::Transaction(transaction) => transaction.rollback_to(name).await,
            ControlTarget::Connection(pair) => {
                run_control(&pair, &format!("ROLLBACK TO SAVEPOINT {}", name)).await
            }
            ControlTarget::Missing => Ok(()),
        }
    }

    /// Release a savepoint on `target`.
    pub async fn release_savepoint(&self, target: &str, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        match self.control_target(target).await {
            ControlTarget::Transaction(transaction) => transaction.release_savepoint(name).await,
            ControlTarget::Connection(pair) => {
                run_control(&pair, &format!("RELEASE SAVEPOINT {}", name)).await
            }
            ControlTarget::Missing => Ok(()),
        }
    }
}

/// SQLite's answer to COMMIT or ROLLBACK in autocommit mode.
fn is_no_transaction(err: &DbError) -> bool {
    matches!(err, DbError::Database { message, .. } if message.contains("no transaction is active"))
}

async fn run_control(pair: &ConnectionPair, sql: &str) -> DbResult<()> {
    let mut conn = pair.write_handle().acquire().await?;
    execute_raw(&mut conn, sql).await?;
    debug!(path = %pair.path(), sql = %sql, "Control statement executed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReturnShape, Value};

    async fn memory_manager(config: ManagerConfig) -> Manager {
        let manager = Manager::new(config);
        manager.connect(":memory:", Some("mem"), false).await.unwrap();
        manager
            .execute(
                "mem",
                QueryRequest::new("CREATE TABLE t (x INTEGER)").with_shape(ReturnShape::None),
            )
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let manager = Manager::new(ManagerConfig::default());
        let out = manager
            .execute("missing", QueryRequest::new("SELECT 1"))
            .await
            .unwrap();
        assert!(out.is_no_connection());

        let err = manager
            .execute("missing", QueryRequest::new("SELECT 1").strict())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ConnectionNotFound { .. }));
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn test_manager_autocommit_commits_open_transaction() {
        let manager = memory_manager(ManagerConfig::new().with_autocommit(true)).await;
        let tx = manager.transaction("mem", false);
        tx.begin().await.unwrap();

        manager
            .execute(
                "mem",
                QueryRequest::new("INSERT INTO t VALUES (1)").with_shape(ReturnShape::None),
            )
            .await
            .unwrap();
        manager
            .execute(
                "mem",
                QueryRequest::new("INSERT INTO t VALUES (2)")
                    .with_shape(ReturnShape::None)
                    .with_override_autocommit(true),
            )
            .await
            .unwrap();
        tx.finish().await.unwrap();

        let out = manager
            .execute("mem", QueryRequest::new("SELECT x FROM t"))
            .await
            .unwrap();
        assert_eq!(out.into_rows(), Some(vec![vec![Value::Integer(1)]]));
    }

    #[tokio::test]
    async fn test_facade_controls_without_transaction_are_noops() {
        let manager = memory_manager(ManagerConfig::default()).await;
        manager.commit("mem").await.unwrap();
        manager.rollback("mem").await.unwrap();
        manager.commit("missing").await.unwrap();
        manager.savepoint("missing", "sp").await.unwrap();

        let err = manager.savepoint("mem", "bad name").await.unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_facade_savepoint_uses_tracked_transaction() {
        let manager = memory_manager(ManagerConfig::default()).await;
        let tx = manager.transaction("mem", true);
        tx.begin().await.unwrap();
        manager.savepoint("mem", "sp").await.unwrap();
        assert_eq!(tx.savepoints(), vec!["sp"]);
        manager.release_savepoint("mem", "sp").await.unwrap();
        assert!(tx.savepoints().is_empty());
        tx.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_invalidates_transaction() {
        let manager = memory_manager(ManagerConfig::default()).await;
        let tx = manager.transaction("mem", true);
        tx.begin().await.unwrap();

        assert!(manager.close("mem").await.unwrap());
        assert_eq!(tx.failed(), Some(true));
        assert!(!manager.close("mem").await.unwrap());
        assert!(manager.databases().await.is_empty());
        assert!(manager.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_runs_request() {
        let manager = memory_manager(ManagerConfig::default()).await;
        let pending = manager
            .enqueue(
                "mem",
                QueryRequest::new("INSERT INTO t VALUES (?)")
                    .with_param(7)
                    .with_shape(ReturnShape::None),
            )
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap(), QueryOutput::RowsAffected(1));

        assert!(manager.shutdown_queue("mem", ShutdownMode::Drain).await.unwrap());
        assert!(!manager.shutdown_queue("mem", ShutdownMode::Drain).await.unwrap());
        assert!(manager.enqueue("missing", QueryRequest::new("SELECT 1")).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let manager = memory_manager(ManagerConfig::default()).await;
        manager.shutdown().await.unwrap();
        assert_eq!(manager.databases().await.len(), 0);
    }
}
