//! Query execution engine.
//!
//! Runs one [`QueryRequest`] against an exclusively held SQLite connection:
//! binds parameters, fetches rows according to the [`ReturnShape`] (only the
//! rows needed are pulled from the engine), decodes them and applies the
//! request's [`RowConverter`]. The executor also owns the manager-wide
//! logging, commit and history policies.

use crate::config::ManagerConfig;
use crate::db::convert::RowConverter;
use crate::db::params::bind_all;
use crate::db::types::{column_names, decode_row};
use crate::error::{DbError, DbResult};
use crate::history::{HistoryEntry, HistoryRecorder};
use crate::models::{NamedRow, Params, QueryOutput, QueryParam, QueryRequest, ReturnShape};
use futures_util::StreamExt;
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Statement runner carrying the manager-wide policies.
#[derive(Clone)]
pub struct QueryExecutor {
    autocommit: bool,
    omni_log: bool,
    log_results: bool,
    history: Option<Arc<dyn HistoryRecorder>>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("autocommit", &self.autocommit)
            .field("omni_log", &self.omni_log)
            .field("log_results", &self.log_results)
            .field("history", &self.history.is_some())
            .finish()
    }
}

impl QueryExecutor {
    pub fn new(config: &ManagerConfig, history: Option<Arc<dyn HistoryRecorder>>) -> Self {
        Self {
            autocommit: config.autocommit_or_default(),
            omni_log: config.omni_log_or_default(),
            log_results: config.log_results_or_default(),
            history,
        }
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn history(&self) -> Option<&Arc<dyn HistoryRecorder>> {
        self.history.as_ref()
    }

    /// Log a statement at info level when asked to, or when omni-log is on
    /// and not overridden.
    pub fn should_log(&self, log: bool, override_omnilog: bool) -> bool {
        log || (self.omni_log && !override_omnilog)
    }

    /// Commit after a statement when asked to, or when autocommit is on and
    /// not overridden.
    pub fn should_commit(&self, commit: bool, override_autocommit: bool) -> bool {
        commit || (self.autocommit && !override_autocommit)
    }

    /// Execute a request on `conn` and record it in the history.
    pub async fn execute(
        &self,
        conn: &mut SqliteConnection,
        path: &str,
        request: &QueryRequest,
    ) -> DbResult<QueryOutput> {
        let start = Instant::now();

        if self.should_log(request.log, request.override_omnilog) {
            info!(path = %path, sql = %request.sql, params = ?request.params, "Executing query");
        } else {
            debug!(
                path = %path,
                sql = %request.sql,
                shape = %request.shape,
                bulk = request.params.is_bulk(),
                "Executing query"
            );
        }

        let result = run_statement(conn, request).await;

        let execution_time_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(output) => debug!(
                path = %path,
                result = %output.summary(),
                execution_time_ms,
                "Query finished"
            ),
            Err(e) => debug!(path = %path, error = %e, execution_time_ms, "Query failed"),
        }

        if self.log_results {
            let entry = HistoryEntry::new(path, request.sql.as_str(), request.params.clone());
            let entry = match &result {
                Ok(output) => entry.with_summary(output.summary()),
                Err(e) => entry.with_failure(e),
            };
            self.record(entry).await;
        }

        result
    }

    /// Hand an entry to the recorder. Failures are logged and swallowed.
    pub async fn record(&self, entry: HistoryEntry) {
        let Some(history) = &self.history else {
            return;
        };
        if let Err(e) = history.record(entry).await {
            warn!(error = %e, "Failed to record query history");
        }
    }

    /// Record a COMMIT or ROLLBACK issued on `path`.
    pub async fn record_control(&self, path: &str, statement: &str) {
        self.record(HistoryEntry::control(path, statement)).await;
    }

    /// Flush the recorder, if any.
    pub async fn flush_history(&self) -> DbResult<()> {
        match &self.history {
            Some(history) => history.flush().await,
            None => Ok(()),
        }
    }
}

/// Run a request on `conn` without logging or history.
///
/// Bulk parameters run the statement once per set, in order, and report
/// the summed rows-affected count whatever the requested shape. The sets
/// apply all together or not at all.
pub async fn run_statement(
    conn: &mut SqliteConnection,
    request: &QueryRequest,
) -> DbResult<QueryOutput> {
    let params: &[QueryParam] = match &request.params {
        Params::Many(sets) => {
            return run_bulk(conn, &request.sql, sets)
                .await
                .map(QueryOutput::RowsAffected);
        }
        Params::Single(params) => params,
        Params::None => &[],
    };

    if request.shape.returns_rows() {
        let rows = sqlite::fetch_rows(conn, &request.sql, params, request.shape).await?;
        let converter = RowConverter::new(&request.column_types);
        let values = rows.iter().map(|row| converter.convert(decode_row(row)));
        if request.named_rows {
            let names = rows.first().map(column_names).unwrap_or_default();
            Ok(QueryOutput::NamedRows(
                values.map(|row| NamedRow::new(&names, row)).collect(),
            ))
        } else {
            Ok(QueryOutput::Rows(values.collect()))
        }
    } else {
        let rows_affected = sqlite::execute_write(conn, &request.sql, params).await?;
        Ok(QueryOutput::RowsAffected(rows_affected))
    }
}

static BULK_SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Run every parameter set under one savepoint. Outside a transaction the
/// savepoint is its own engine transaction, inside one it nests.
async fn run_bulk(
    conn: &mut SqliteConnection,
    sql: &str,
    sets: &[Vec<QueryParam>],
) -> DbResult<u64> {
    let savepoint = format!("bulk_{}", BULK_SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed));
    execute_raw(conn, &format!("SAVEPOINT {}", savepoint)).await?;

    let mut total = 0;
    let mut failure = None;
    for set in sets {
        match sqlite::execute_write(conn, sql, set).await {
            Ok(rows) => total += rows,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    match failure {
        None => {
            execute_raw(conn, &format!("RELEASE SAVEPOINT {}", savepoint)).await?;
            Ok(total)
        }
        Some(e) => {
            for undo in [
                format!("ROLLBACK TO SAVEPOINT {}", savepoint),
                format!("RELEASE SAVEPOINT {}", savepoint),
            ] {
                if let Err(undo_err) = execute_raw(conn, &undo).await {
                    warn!(savepoint = %savepoint, error = %undo_err, "Failed to undo partial bulk statement");
                }
            }
            Err(e)
        }
    }
}

/// Execute a statement without parameters or results (BEGIN, SAVEPOINT...).
pub async fn execute_raw(conn: &mut SqliteConnection, sql: &str) -> DbResult<()> {
    sqlite::execute_write(conn, sql, &[]).await.map(|_| ())
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn collect_rows<R>(results: Vec<Result<R, sqlx::Error>>) -> DbResult<Vec<R>> {
    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        rows.push(result.map_err(DbError::from)?);
    }
    Ok(rows)
}

mod sqlite {
    use super::*;
    use sqlx::Executor;

    pub async fn fetch_rows(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        shape: ReturnShape,
    ) -> DbResult<Vec<SqliteRow>> {
        let fetch_limit = shape.limit().unwrap_or(usize::MAX);
        let results = if params.is_empty() {
            let stream = (&mut *conn).fetch(sql);
            stream.take(fetch_limit).collect::<Vec<_>>().await
        } else {
            let stream = bind_all(sql, params).fetch(&mut *conn);
            stream.take(fetch_limit).collect::<Vec<_>>().await
        };
        collect_rows(results)
    }

    pub async fn execute_write(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            (&mut *conn).execute(sql).await
        } else {
            bind_all(sql, params).execute(&mut *conn).await
        };
        Ok(result?.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TypeTag, Value};
    use sqlx::Connection;

    async fn memory_conn() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        execute_raw(&mut conn, "CREATE TABLE t (id INTEGER, flag TEXT)")
            .await
            .unwrap();
        conn
    }

    #[test]
    fn test_policies() {
        let executor = QueryExecutor::new(&ManagerConfig::new().with_autocommit(true), None);
        assert!(executor.should_commit(false, false));
        assert!(!executor.should_commit(false, true));
        assert!(executor.should_commit(true, true));
        assert!(!executor.should_log(false, false));
        assert!(executor.should_log(true, true));

        let executor = QueryExecutor::new(&ManagerConfig::new().with_omni_log(true), None);
        assert!(executor.should_log(false, false));
        assert!(!executor.should_log(false, true));
        assert!(!executor.should_commit(false, false));
    }

    #[tokio::test]
    async fn test_shapes() {
        let mut conn = memory_conn().await;
        let insert = QueryRequest::new("INSERT INTO t VALUES (?, ?)")
            .with_params(vec![
                vec![QueryParam::Int(1), QueryParam::from("1")],
                vec![QueryParam::Int(2), QueryParam::from("0")],
                vec![QueryParam::Int(3), QueryParam::from("x")],
            ])
            .with_shape(ReturnShape::None);
        assert_eq!(
            run_statement(&mut conn, &insert).await.unwrap(),
            QueryOutput::RowsAffected(3)
        );

        let select = QueryRequest::new("SELECT id FROM t ORDER BY id");
        let all = run_statement(&mut conn, &select).await.unwrap();
        assert_eq!(all.rows().unwrap().len(), 3);

        let one = run_statement(&mut conn, &select.clone().with_shape(ReturnShape::One))
            .await
            .unwrap();
        assert_eq!(one, QueryOutput::Rows(vec![vec![Value::Integer(1)]]));

        let two = run_statement(&mut conn, &select.with_shape(ReturnShape::Many(2)))
            .await
            .unwrap();
        assert_eq!(two.rows().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_column_types_applied() {
        let mut conn = memory_conn().await;
        execute_raw(&mut conn, "INSERT INTO t VALUES (1, '1')")
            .await
            .unwrap();

        let tagged = QueryRequest::new("SELECT id, flag FROM t")
            .with_shape(ReturnShape::One)
            .with_column_types(vec![None, Some(TypeTag::Bool)]);
        let out = run_statement(&mut conn, &tagged).await.unwrap();
        assert_eq!(out.first(), Some(&vec![Value::Integer(1), Value::Bool(true)]));
    }

    #[tokio::test]
    async fn test_named_rows() {
        let mut conn = memory_conn().await;
        execute_raw(&mut conn, "INSERT INTO t VALUES (1, '0'), (2, '1')")
            .await
            .unwrap();

        let req = QueryRequest::new("SELECT id, flag AS active FROM t ORDER BY id")
            .with_column_types(vec![None, Some(TypeTag::Bool)])
            .with_named_rows(true);
        let out = run_statement(&mut conn, &req).await.unwrap();
        let rows = out.named_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&Value::Integer(1)));
        assert_eq!(rows[1].get("active"), Some(&Value::Bool(true)));
        assert!(out.rows().is_none());
        assert_eq!(out.summary(), "2 row(s)");
    }

    #[tokio::test]
    async fn test_parameterized_select() {
        let mut conn = memory_conn().await;
        execute_raw(&mut conn, "INSERT INTO t VALUES (1, 'a'), (2, 'b')")
            .await
            .unwrap();

        let req = QueryRequest::new("SELECT flag FROM t WHERE id = ?").with_param(2);
        let out = run_statement(&mut conn, &req).await.unwrap();
        assert_eq!(out, QueryOutput::Rows(vec![vec![Value::Text("b".into())]]));
    }

    #[tokio::test]
    async fn test_failed_bulk_leaves_no_rows() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        execute_raw(&mut conn, "CREATE TABLE k (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();

        let insert = QueryRequest::new("INSERT INTO k VALUES (?)")
            .with_params(vec![
                vec![QueryParam::Int(1)],
                vec![QueryParam::Int(2)],
                vec![QueryParam::Int(1)],
            ])
            .with_shape(ReturnShape::None);
        let err = run_statement(&mut conn, &insert).await.unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));

        let count = run_statement(&mut conn, &QueryRequest::new("SELECT COUNT(*) FROM k"))
            .await
            .unwrap();
        assert_eq!(count.first(), Some(&vec![Value::Integer(0)]));

        // The connection is usable and outside any transaction afterwards.
        execute_raw(&mut conn, "BEGIN").await.unwrap();
        execute_raw(&mut conn, "COMMIT").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_bulk_inside_transaction_keeps_earlier_work() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        execute_raw(&mut conn, "CREATE TABLE k (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        execute_raw(&mut conn, "BEGIN").await.unwrap();
        execute_raw(&mut conn, "INSERT INTO k VALUES (10)").await.unwrap();

        let insert = QueryRequest::new("INSERT INTO k VALUES (?)")
            .with_params(vec![vec![QueryParam::Int(1)], vec![QueryParam::Int(10)]])
            .with_shape(ReturnShape::None);
        assert!(run_statement(&mut conn, &insert).await.is_err());
        execute_raw(&mut conn, "COMMIT").await.unwrap();

        let rows = run_statement(&mut conn, &QueryRequest::new("SELECT id FROM k"))
            .await
            .unwrap();
        assert_eq!(rows, QueryOutput::Rows(vec![vec![Value::Integer(10)]]));
    }

    #[tokio::test]
    async fn test_engine_error_is_database_error() {
        let mut conn = memory_conn().await;
        let err = run_statement(&mut conn, &QueryRequest::new("SELEC 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
    }
}
