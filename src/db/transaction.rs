//! Transaction state machine.
//!
//! A [`Transaction`] is bound to the write handle of one connection pair from
//! `begin` until it exits. It moves `Created -> Active -> Committed |
//! RolledBack` exactly once; its [`TransactionOutcome`] stays `InProgress`
//! until exit and is fixed afterwards.
//!
//! Statements lock the write handle one at a time, so other callers of the
//! same path run between them (inside the same engine transaction, as with
//! any shared SQLite connection). A safe transaction also holds the path's
//! exclusive section from `begin` to exit.
//!
//! Dropping an active transaction without exiting it rolls it back on a
//! spawned task. Until that ROLLBACK has run, every other acquirer of the
//! write handle waits, so no plain statement joins the abandoned
//! transaction.

use crate::db::coordinator::WriteGuard;
use crate::db::executor::execute_raw;
use crate::db::registry::DbHandle;
use crate::error::{DbError, DbResult};
use crate::manager::Manager;
use crate::models::{QueryOutput, QueryRequest, TransactionInfo, TransactionOutcome, TransactionState};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Check that `name` is a plain identifier that can be interpolated into a
/// SAVEPOINT statement.
pub fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DbError::validation(format!(
            "Invalid savepoint name '{}': use letters, digits and underscores, not starting with a digit",
            name
        )))
    }
}

struct TxState {
    state: TransactionState,
    outcome: TransactionOutcome,
    path: Option<String>,
    started_at: Option<DateTime<Utc>>,
    savepoints: Vec<String>,
    write: Option<DbHandle>,
    exclusive: Option<WriteGuard>,
}

impl TxState {
    fn settle(&mut self, state: TransactionState, outcome: TransactionOutcome) {
        self.state = state;
        if !self.outcome.is_settled() {
            self.outcome = outcome;
        }
        self.savepoints.clear();
        self.write = None;
        self.exclusive = None;
    }
}

pub(crate) struct TransactionCore {
    id: String,
    target: String,
    autocommit: bool,
    safe: bool,
    log_all: bool,
    manager: Manager,
    /// Serializes begin, commit, rollback, savepoints and exit.
    ops: Mutex<()>,
    state: StdMutex<TxState>,
}

impl TransactionCore {
    fn lock_state(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TransactionCore {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if !state.state.is_active() {
            return;
        }
        let write = state.write.take();
        let exclusive = state.exclusive.take();
        let path = state.path.clone().unwrap_or_default();
        state.settle(TransactionState::RolledBack, TransactionOutcome::Failed);

        let Some(write) = write else {
            return;
        };
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let gate = write.rollback_gate();
                runtime.spawn(async move {
                    let _exclusive = exclusive;
                    match gate.rollback().await {
                        Ok(()) => warn!(
                            transaction_id = %id,
                            path = %path,
                            "Active transaction dropped without exit, rolled back"
                        ),
                        Err(e) => warn!(
                            transaction_id = %id,
                            path = %path,
                            error = %e,
                            "Rollback of dropped transaction failed"
                        ),
                    }
                });
            }
            Err(_) => warn!(
                transaction_id = %id,
                path = %path,
                "Active transaction dropped outside a runtime; the engine rolls it back when the connection closes"
            ),
        }
    }
}

/// A transaction on one database. Clones refer to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    core: Arc<TransactionCore>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.core.id)
            .field("target", &self.core.target)
            .field("state", &self.state())
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(manager: Manager, target: &str, autocommit: bool, safe: bool) -> Self {
        let id = format!("tx_{}", uuid::Uuid::new_v4().simple());
        Self {
            core: Arc::new(TransactionCore {
                id,
                target: target.to_string(),
                autocommit,
                safe,
                log_all: false,
                manager,
                ops: Mutex::new(()),
                state: StdMutex::new(TxState {
                    state: TransactionState::Created,
                    outcome: TransactionOutcome::InProgress,
                    path: None,
                    started_at: None,
                    savepoints: Vec::new(),
                    write: None,
                    exclusive: None,
                }),
            }),
        }
    }

    /// Log every statement of this transaction at info level.
    ///
    /// Only effective before the transaction is shared; a clone keeps the
    /// setting it was made with.
    pub fn with_log_all(mut self, log_all: bool) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.log_all = log_all;
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// The path or alias the transaction was created for.
    pub fn target(&self) -> &str {
        &self.core.target
    }

    /// Canonical path, known once begun.
    pub fn path(&self) -> Option<String> {
        self.core.lock_state().path.clone()
    }

    pub fn autocommit(&self) -> bool {
        self.core.autocommit
    }

    pub fn is_safe(&self) -> bool {
        self.core.safe
    }

    pub fn state(&self) -> TransactionState {
        self.core.lock_state().state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn outcome(&self) -> TransactionOutcome {
        self.core.lock_state().outcome
    }

    /// `None` until the transaction exits, then whether it committed.
    pub fn succeeded(&self) -> Option<bool> {
        match self.outcome() {
            TransactionOutcome::InProgress => None,
            outcome => Some(outcome == TransactionOutcome::Succeeded),
        }
    }

    /// `None` until the transaction exits, then whether it rolled back.
    pub fn failed(&self) -> Option<bool> {
        self.succeeded().map(|succeeded| !succeeded)
    }

    /// Open savepoints, outermost first.
    pub fn savepoints(&self) -> Vec<String> {
        self.core.lock_state().savepoints.clone()
    }

    pub fn info(&self) -> TransactionInfo {
        let state = self.core.lock_state();
        TransactionInfo {
            id: self.core.id.clone(),
            path: state.path.clone().unwrap_or_else(|| self.core.target.clone()),
            started_at: state.started_at.unwrap_or_else(Utc::now),
            state: state.state,
            outcome: state.outcome,
            autocommit: self.core.autocommit,
            savepoints: state.savepoints.clone(),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<TransactionCore> {
        Arc::downgrade(&self.core)
    }

    fn tx_error(&self, message: impl Into<String>) -> DbError {
        DbError::transaction(message, self.core.id.clone())
    }

    /// Write handle and path of the active transaction.
    fn binding(&self) -> DbResult<(String, DbHandle)> {
        let state = self.core.lock_state();
        match (&state.state, &state.path, &state.write) {
            (TransactionState::Active, Some(path), Some(write)) => Ok((path.clone(), write.clone())),
            (state, _, _) => Err(self.tx_error(format!("Transaction is not active ({:?})", state))),
        }
    }

    async fn run_control(&self, write: &DbHandle, sql: &str) -> DbResult<()> {
        let mut conn = write.acquire().await?;
        execute_raw(&mut conn, sql).await
    }

    /// Enter the transaction: bind the write handle and issue BEGIN.
    ///
    /// Fails without any state change if the target has no connection or
    /// BEGIN cannot be issued.
    pub async fn begin(&self) -> DbResult<()> {
        let _ops = self.core.ops.lock().await;
        if self.state() != TransactionState::Created {
            return Err(self.tx_error("Transaction has already been entered"));
        }

        let manager = &self.core.manager;
        let pair = manager
            .registry()
            .get_pair(&self.core.target)
            .await
            .ok_or_else(|| self.tx_error(format!("No connection for '{}'", self.core.target)))?;
        let path = pair.path().to_string();

        let exclusive = if self.core.safe {
            Some(manager.coordinator().exclusive_section(&path).await?)
        } else {
            None
        };

        let write = pair.write_handle().clone();
        let begin_err = |e: DbError| self.tx_error(format!("Failed to begin transaction: {}", e));
        // Registered before the connection is released, so facade controls
        // never see the engine transaction without its tracked owner.
        let conn = {
            let mut conn = write.acquire().await.map_err(begin_err)?;
            execute_raw(&mut conn, "BEGIN").await.map_err(begin_err)?;
            conn
        };

        {
            let mut state = self.core.lock_state();
            state.state = TransactionState::Active;
            state.path = Some(path.clone());
            state.started_at = Some(Utc::now());
            state.write = Some(write);
            state.exclusive = exclusive;
        }
        manager.tracker().register(&path, self);
        drop(conn);

        info!(
            transaction_id = %self.core.id,
            path = %path,
            safe = self.core.safe,
            autocommit = self.core.autocommit,
            "BEGIN transaction"
        );
        Ok(())
    }

    /// Run a statement on the transaction's write handle.
    ///
    /// The request's access mode is ignored. Commits afterwards under the
    /// same per-statement rule as [`Manager::execute`].
    pub async fn execute(&self, request: QueryRequest) -> DbResult<QueryOutput> {
        let (path, write) = self.binding()?;
        let request = if self.core.log_all {
            request.with_log(true)
        } else {
            request
        };

        let executor = self.core.manager.executor();
        let output = {
            let mut conn = write.acquire().await?;
            executor.execute(&mut conn, &path, &request).await?
        };

        if executor.should_commit(request.commit, request.override_autocommit) {
            self.commit().await?;
        }
        Ok(output)
    }

    /// Commit the work so far and keep the transaction open.
    /// A no-op once the transaction has exited.
    pub async fn commit(&self) -> DbResult<()> {
        self.restart("COMMIT").await
    }

    /// Discard the work so far and keep the transaction open.
    /// A no-op once the transaction has exited.
    pub async fn rollback(&self) -> DbResult<()> {
        self.restart("ROLLBACK").await
    }

    async fn restart(&self, statement: &str) -> DbResult<()> {
        let _ops = self.core.ops.lock().await;
        let Ok((path, write)) = self.binding() else {
            debug!(transaction_id = %self.core.id, statement, "Transaction not active, ignoring");
            return Ok(());
        };

        {
            let mut conn = write.acquire().await?;
            execute_raw(&mut conn, statement)
                .await
                .map_err(|e| self.tx_error(format!("{} failed: {}", statement, e)))?;
            execute_raw(&mut conn, "BEGIN")
                .await
                .map_err(|e| self.tx_error(format!("BEGIN after {} failed: {}", statement, e)))?;
        }
        self.core.lock_state().savepoints.clear();
        self.core
            .manager
            .executor()
            .record_control(&path, statement)
            .await;

        info!(transaction_id = %self.core.id, path = %path, "{}", statement);
        Ok(())
    }

    /// Create a savepoint and push it on the stack.
    pub async fn savepoint(&self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        let _ops = self.core.ops.lock().await;
        let (path, write) = self.binding()?;

        self.run_control(&write, &format!("SAVEPOINT {}", name))
            .await
            .map_err(|e| self.tx_error(format!("Failed to create savepoint '{}': {}", name, e)))?;
        self.core.lock_state().savepoints.push(name.to_string());

        debug!(transaction_id = %self.core.id, path = %path, savepoint = %name, "Savepoint created");
        Ok(())
    }

    /// Undo everything after `name` was created. The savepoint stays on the
    /// stack and can be rolled back to again; savepoints created after it
    /// are discarded.
    pub async fn rollback_to(&self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        let _ops = self.core.ops.lock().await;
        let (path, write) = self.binding()?;
        let position = self.savepoint_position(name)?;

        self.run_control(&write, &format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
            .map_err(|e| {
                self.tx_error(format!("Failed to roll back to savepoint '{}': {}", name, e))
            })?;
        self.core.lock_state().savepoints.truncate(position + 1);

        info!(transaction_id = %self.core.id, path = %path, savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    /// Release `name` and every savepoint created after it, keeping their
    /// effects in the enclosing transaction.
    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        let _ops = self.core.ops.lock().await;
        let (path, write) = self.binding()?;
        let position = self.savepoint_position(name)?;

        self.run_control(&write, &format!("RELEASE SAVEPOINT {}", name))
            .await
            .map_err(|e| self.tx_error(format!("Failed to release savepoint '{}': {}", name, e)))?;
        self.core.lock_state().savepoints.truncate(position);

        debug!(transaction_id = %self.core.id, path = %path, savepoint = %name, "Savepoint released");
        Ok(())
    }

    fn savepoint_position(&self, name: &str) -> DbResult<usize> {
        self.core
            .lock_state()
            .savepoints
            .iter()
            .rposition(|s| s == name)
            .ok_or_else(|| self.tx_error(format!("No savepoint named '{}'", name)))
    }

    /// Normal exit: commit if autocommit is set, else roll back.
    ///
    /// The outcome is `Succeeded` only when the commit ran. Calling this on
    /// a transaction that already exited does nothing.
    pub async fn finish(&self) -> DbResult<()> {
        let _ops = self.core.ops.lock().await;
        let (path, write) = match self.state() {
            TransactionState::Created => {
                return Err(self.tx_error("Transaction was never entered"));
            }
            TransactionState::Active => self.binding()?,
            _ => return Ok(()),
        };

        let executor = self.core.manager.executor();
        if self.core.autocommit {
            match self.run_control(&write, "COMMIT").await {
                Ok(()) => {
                    self.settle(&path, TransactionState::Committed, TransactionOutcome::Succeeded);
                    executor.record_control(&path, "COMMIT").await;
                    info!(transaction_id = %self.core.id, path = %path, "COMMIT transaction");
                    Ok(())
                }
                Err(e) => {
                    if let Err(rollback_err) = self.run_control(&write, "ROLLBACK").await {
                        warn!(
                            transaction_id = %self.core.id,
                            path = %path,
                            error = %rollback_err,
                            "Rollback after failed commit also failed"
                        );
                    }
                    self.settle(&path, TransactionState::RolledBack, TransactionOutcome::Failed);
                    executor.record_control(&path, "ROLLBACK").await;
                    Err(self.tx_error(format!("Failed to commit transaction: {}", e)))
                }
            }
        } else {
            let rolled_back = self.run_control(&write, "ROLLBACK").await;
            self.settle(&path, TransactionState::RolledBack, TransactionOutcome::Failed);
            executor.record_control(&path, "ROLLBACK").await;
            info!(transaction_id = %self.core.id, path = %path, "ROLLBACK transaction");
            rolled_back.map_err(|e| self.tx_error(format!("Failed to roll back transaction: {}", e)))
        }
    }

    /// Error exit: roll back whatever the autocommit policy and hand back
    /// `error`. A rollback failure is logged, never returned in its place.
    /// A transaction that is not active is left untouched.
    pub async fn abort<E>(&self, error: E) -> E {
        let _ops = self.core.ops.lock().await;
        if let Ok((path, write)) = self.binding() {
            if let Err(e) = self.run_control(&write, "ROLLBACK").await {
                warn!(
                    transaction_id = %self.core.id,
                    path = %path,
                    error = %e,
                    "Rollback after error failed"
                );
            }
            self.settle(&path, TransactionState::RolledBack, TransactionOutcome::Failed);
            self.core
                .manager
                .executor()
                .record_control(&path, "ROLLBACK")
                .await;
            info!(transaction_id = %self.core.id, path = %path, "ROLLBACK transaction after error");
        }
        error
    }

    /// Mark the transaction rolled back because its connection is closing.
    pub(crate) async fn invalidate(&self) {
        let _ops = self.core.ops.lock().await;
        if let Ok((path, _)) = self.binding() {
            self.settle(&path, TransactionState::RolledBack, TransactionOutcome::Failed);
            warn!(transaction_id = %self.core.id, path = %path, "Connection closed under active transaction");
        }
    }

    fn settle(&self, path: &str, state: TransactionState, outcome: TransactionOutcome) {
        self.core.lock_state().settle(state, outcome);
        self.core.manager.tracker().unregister(path, &self.core.id);
    }

    /// Run `body` inside the transaction: begin, then exit normally when it
    /// returns `Ok`, or roll back and return its error when it fails.
    ///
    /// If the enclosing task is cancelled mid-body, the transaction rolls
    /// back when its last handle is dropped.
    pub async fn scope<F, T, E>(&self, body: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: From<DbError>,
    {
        self.begin().await?;
        match body(self).await {
            Ok(value) => {
                self.finish().await?;
                Ok(value)
            }
            Err(e) => Err(self.abort(e).await),
        }
    }
}

/// Open transactions by canonical path.
///
/// Entries are weak so tracking never keeps a dropped transaction alive.
#[derive(Default)]
pub struct TransactionTracker {
    active: StdMutex<HashMap<String, Weak<TransactionCore>>>,
}

impl std::fmt::Debug for TransactionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTracker")
            .field("paths", &self.entries().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Weak<TransactionCore>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(&self, path: &str, transaction: &Transaction) {
        let previous = self
            .entries()
            .insert(path.to_string(), transaction.downgrade());
        if previous.is_some_and(|weak| weak.strong_count() > 0) {
            debug!(path = %path, transaction_id = %transaction.id(), "Replacing tracked transaction");
        }
    }

    pub(crate) fn unregister(&self, path: &str, id: &str) {
        let mut entries = self.entries();
        let matches = entries
            .get(path)
            .and_then(Weak::upgrade)
            .is_none_or(|core| core.id == id);
        if matches {
            entries.remove(path);
        }
    }

    /// The active transaction on `path`, if any.
    pub fn current(&self, path: &str) -> Option<Transaction> {
        let mut entries = self.entries();
        let core = entries.get(path).and_then(Weak::upgrade);
        match core {
            Some(core) => {
                let transaction = Transaction { core };
                transaction.is_active().then_some(transaction)
            }
            None => {
                entries.remove(path);
                None
            }
        }
    }

    /// Every active transaction.
    pub fn list(&self) -> Vec<Transaction> {
        let mut entries = self.entries();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries
            .values()
            .filter_map(Weak::upgrade)
            .map(|core| Transaction { core })
            .filter(Transaction::is_active)
            .collect()
    }

    pub fn rename(&self, old: &str, new: &str) {
        let mut entries = self.entries();
        if let Some(weak) = entries.remove(old) {
            if let Some(core) = weak.upgrade() {
                core.lock_state().path = Some(new.to_string());
            }
            entries.insert(new.to_string(), weak);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::models::{ReturnShape, Value};

    async fn manager() -> Manager {
        let manager = Manager::new(ManagerConfig::default());
        manager.connect(":memory:", Some("mem"), false).await.unwrap();
        manager
            .execute("mem", QueryRequest::new("CREATE TABLE t (x INTEGER)").with_shape(ReturnShape::None))
            .await
            .unwrap();
        manager
    }

    async fn count(manager: &Manager) -> i64 {
        let out = manager
            .execute("mem", QueryRequest::new("SELECT COUNT(*) FROM t").with_shape(ReturnShape::One))
            .await
            .unwrap();
        out.first().and_then(|row| row[0].as_i64()).unwrap()
    }

    fn insert(x: i64) -> QueryRequest {
        QueryRequest::new("INSERT INTO t VALUES (?)")
            .with_param(x)
            .with_shape(ReturnShape::None)
    }

    #[test]
    fn test_savepoint_name_validation() {
        assert!(validate_savepoint_name("sp1").is_ok());
        assert!(validate_savepoint_name("_inner_2").is_ok());
        for bad in ["", "1sp", "sp-1", "sp; DROP TABLE t", "sp 1", "naïve"] {
            let err = validate_savepoint_name(bad).unwrap_err();
            assert!(matches!(err, DbError::Validation { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_outcome_lifecycle() {
        let manager = manager().await;
        let tx = manager.transaction("mem", true);
        assert_eq!(tx.state(), TransactionState::Created);
        assert_eq!(tx.succeeded(), None);

        tx.begin().await.unwrap();
        assert!(tx.is_active());
        assert_eq!(tx.failed(), None);
        tx.execute(insert(1)).await.unwrap();

        tx.finish().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(tx.succeeded(), Some(true));
        assert_eq!(tx.failed(), Some(false));

        // Exited transactions ignore further control calls.
        tx.commit().await.unwrap();
        tx.rollback().await.unwrap();
        tx.finish().await.unwrap();
        assert_eq!(tx.succeeded(), Some(true));
        assert_eq!(count(&manager).await, 1);
    }

    #[tokio::test]
    async fn test_begin_twice_fails() {
        let manager = manager().await;
        let tx = manager.transaction("mem", true);
        tx.begin().await.unwrap();
        assert!(matches!(tx.begin().await, Err(DbError::Transaction { .. })));
        tx.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_without_connection() {
        let manager = Manager::new(ManagerConfig::default());
        let tx = manager.transaction("nowhere", true);
        let err = tx.begin().await.unwrap_err();
        assert!(matches!(err, DbError::Transaction { .. }));
        assert_eq!(tx.state(), TransactionState::Created);
        assert_eq!(tx.succeeded(), None);
    }

    #[tokio::test]
    async fn test_abort_before_begin_leaves_outcome_open() {
        let manager = manager().await;
        let tx = manager.transaction("mem", true);
        let err = tx.abort(DbError::internal("early")).await;
        assert!(matches!(err, DbError::Internal { .. }));
        assert_eq!(tx.state(), TransactionState::Created);
        assert_eq!(tx.failed(), None);

        tx.begin().await.unwrap();
        tx.execute(insert(1)).await.unwrap();
        tx.finish().await.unwrap();
        assert_eq!(tx.succeeded(), Some(true));
        assert_eq!(tx.failed(), Some(false));
    }

    #[tokio::test]
    async fn test_statement_after_drop_waits_for_rollback() {
        let manager = manager().await;
        let tx = manager.transaction("mem", true);
        tx.begin().await.unwrap();
        tx.execute(insert(1)).await.unwrap();
        drop(tx);

        // Issued before the spawned rollback had a chance to run.
        manager.execute("mem", insert(2)).await.unwrap();
        let rows = manager
            .execute("mem", QueryRequest::new("SELECT x FROM t"))
            .await
            .unwrap();
        assert_eq!(rows, QueryOutput::Rows(vec![vec![Value::Integer(2)]]));
        assert!(manager.current_transaction("mem").await.is_none());
    }

    #[tokio::test]
    async fn test_no_autocommit_rolls_back_on_exit() {
        let manager = manager().await;
        let tx = manager.transaction("mem", false);
        tx.begin().await.unwrap();
        tx.execute(insert(1)).await.unwrap();
        tx.finish().await.unwrap();

        assert_eq!(tx.failed(), Some(true));
        assert_eq!(count(&manager).await, 0);
    }

    #[tokio::test]
    async fn test_manual_commit_survives_rollback_exit() {
        let manager = manager().await;
        let tx = manager.transaction("mem", false);
        tx.begin().await.unwrap();
        tx.execute(insert(1)).await.unwrap();
        tx.commit().await.unwrap();
        assert!(tx.is_active());
        tx.execute(insert(2)).await.unwrap();
        tx.finish().await.unwrap();

        assert_eq!(count(&manager).await, 1);
    }

    #[tokio::test]
    async fn test_savepoint_stack() {
        let manager = manager().await;
        let tx = manager.transaction("mem", true);
        tx.begin().await.unwrap();
        tx.savepoint("a").await.unwrap();
        tx.savepoint("b").await.unwrap();
        tx.savepoint("c").await.unwrap();

        tx.rollback_to("b").await.unwrap();
        assert_eq!(tx.savepoints(), vec!["a", "b"]);
        tx.rollback_to("b").await.unwrap();

        tx.release_savepoint("a").await.unwrap();
        assert!(tx.savepoints().is_empty());

        let err = tx.rollback_to("a").await.unwrap_err();
        assert!(matches!(err, DbError::Transaction { .. }));
        tx.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_error_rolls_back() {
        let manager = manager().await;
        let tx = manager.transaction("mem", true);
        let result: Result<(), DbError> = tx
            .scope(|tx| {
                Box::pin(async move {
                    tx.execute(insert(1)).await?;
                    Err(DbError::internal("boom"))
                })
            })
            .await;

        assert!(matches!(result, Err(DbError::Internal { .. })));
        assert_eq!(tx.failed(), Some(true));
        assert_eq!(count(&manager).await, 0);
    }

    #[tokio::test]
    async fn test_tracker_follows_lifecycle() {
        let manager = manager().await;
        let tx = manager.transaction("mem", true);
        assert!(manager.current_transaction("mem").await.is_none());

        tx.begin().await.unwrap();
        let tracked = manager.current_transaction("mem").await.unwrap();
        assert_eq!(tracked.id(), tx.id());

        tx.finish().await.unwrap();
        assert!(manager.current_transaction("mem").await.is_none());
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let manager = manager().await;
        {
            let tx = manager.transaction("mem", true);
            tx.begin().await.unwrap();
            tx.execute(insert(1)).await.unwrap();
        }
        // The rollback runs on a spawned task.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count(&manager).await, 0);
        assert!(manager.current_transaction("mem").await.is_none());
    }

    #[tokio::test]
    async fn test_info() {
        let manager = manager().await;
        let tx = manager.transaction("mem", false);
        tx.begin().await.unwrap();
        tx.savepoint("sp").await.unwrap();
        let info = tx.info();
        assert_eq!(info.path, ":memory:");
        assert_eq!(info.state, TransactionState::Active);
        assert_eq!(info.savepoints, vec!["sp".to_string()]);
        assert!(!info.autocommit);
        assert_eq!(
            manager
                .execute("mem", QueryRequest::new("SELECT 1").with_shape(ReturnShape::One))
                .await
                .unwrap()
                .first()
                .cloned(),
            Some(vec![Value::Integer(1)])
        );
        tx.finish().await.unwrap();
    }
}
