//! Parameter binding utilities for SQLite queries.

use crate::models::QueryParam;
use sqlx::Sqlite;
use sqlx::sqlite::SqliteArguments;

pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(query: SqliteQuery<'q>, param: &'q QueryParam) -> SqliteQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Build a query with every parameter bound in order.
pub(crate) fn bind_all<'q>(sql: &'q str, params: &'q [QueryParam]) -> SqliteQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_sqlite_param(query, param))
}
