//! Query-related data models.
//!
//! This module defines types for SQL query requests and results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::connection::AccessMode;
use super::value::{NamedRow, Row, TypeTag};
use crate::error::DbError;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for QueryParam {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<i64> for QueryParam {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for QueryParam {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for QueryParam {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Parameters bound to one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    #[default]
    None,
    /// One parameter set, executed once.
    Single(Vec<QueryParam>),
    /// Several parameter sets; the statement runs once per set, in order.
    Many(Vec<Vec<QueryParam>>),
}

impl Params {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Single(params) => params.is_empty(),
            Self::Many(sets) => sets.is_empty(),
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, Self::Many(_))
    }
}

impl From<Vec<QueryParam>> for Params {
    fn from(params: Vec<QueryParam>) -> Self {
        Self::Single(params)
    }
}

impl From<Vec<Vec<QueryParam>>> for Params {
    fn from(sets: Vec<Vec<QueryParam>>) -> Self {
        Self::Many(sets)
    }
}

/// How many rows a statement should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnShape {
    /// First row only (zero or one row).
    One,
    /// Every row.
    #[default]
    All,
    /// At most `n` rows, `n >= 1`.
    Many(usize),
    /// Execute only; report rows affected.
    None,
}

impl ReturnShape {
    /// Build a `Many(n)` shape, normalizing `n == 1` to `One`.
    pub fn many(n: usize) -> Result<Self, DbError> {
        match n {
            0 => Err(DbError::validation(
                "Row count for a fetch must be a positive integer",
            )),
            1 => Ok(Self::One),
            n => Ok(Self::Many(n)),
        }
    }

    /// True when the statement's rows are returned to the caller.
    pub fn returns_rows(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Upper bound on rows collected, `None` for unbounded.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::One => Some(1),
            Self::Many(n) => Some(*n),
            Self::All | Self::None => None,
        }
    }
}

impl FromStr for ReturnShape {
    type Err = DbError;

    /// Accepts "one"/"fetchone", "all"/"fetchall", "none", or a positive
    /// integer. Underscores and spaces are ignored, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "one" | "fetchone" => Ok(Self::One),
            "all" | "fetchall" => Ok(Self::All),
            "none" => Ok(Self::None),
            other => match other.parse::<usize>() {
                Ok(n) => Self::many(n),
                Err(_) => Err(DbError::validation(format!(
                    "Invalid return shape: '{}'",
                    s
                ))),
            },
        }
    }
}

impl fmt::Display for ReturnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One => write!(f, "fetchone"),
            Self::All => write!(f, "fetchall"),
            Self::Many(n) => write!(f, "fetchmany ({})", n),
            Self::None => write!(f, "none"),
        }
    }
}

/// A statement plus every per-call option accepted by `execute`.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Params,
    pub shape: ReturnShape,
    /// Per-column type tags; empty means automatic conversion everywhere.
    pub column_types: Vec<Option<TypeTag>>,
    /// Commit after the statement.
    pub commit: bool,
    /// Ignore the manager-wide autocommit policy for this call.
    pub override_autocommit: bool,
    pub mode: AccessMode,
    /// Log the statement at info level.
    pub log: bool,
    /// Ignore the manager-wide omni-log policy for this call.
    pub override_omnilog: bool,
    /// Fail with `ConnectionNotFound` instead of returning the no-op sentinel.
    pub strict: bool,
    /// Return rows keyed by column name.
    pub named_rows: bool,
}

impl QueryRequest {
    /// Create a new query request with default options.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::None,
            shape: ReturnShape::All,
            column_types: Vec::new(),
            commit: false,
            override_autocommit: false,
            mode: AccessMode::Write,
            log: false,
            override_omnilog: false,
            strict: false,
            named_rows: false,
        }
    }

    /// Add a parameter to the single parameter set.
    ///
    /// Has no effect on a request that already carries bulk parameters.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        let param = param.into();
        if let Params::Single(params) = &mut self.params {
            params.push(param);
        } else if matches!(self.params, Params::None) {
            self.params = Params::Single(vec![param]);
        }
        self
    }

    /// Replace the parameters.
    pub fn with_params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_shape(mut self, shape: ReturnShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_column_types(mut self, column_types: Vec<Option<TypeTag>>) -> Self {
        self.column_types = column_types;
        self
    }

    pub fn with_commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    pub fn with_override_autocommit(mut self, override_autocommit: bool) -> Self {
        self.override_autocommit = override_autocommit;
        self
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn with_override_omnilog(mut self, override_omnilog: bool) -> Self {
        self.override_omnilog = override_omnilog;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn with_named_rows(mut self, named_rows: bool) -> Self {
        self.named_rows = named_rows;
        self
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutput {
    Rows(Vec<Row>),
    NamedRows(Vec<NamedRow>),
    RowsAffected(u64),
    /// The target path or alias had no open connection (non-strict mode).
    NoConnection,
}

impl QueryOutput {
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn named_rows(&self) -> Option<&[NamedRow]> {
        match self {
            Self::NamedRows(rows) => Some(rows),
            _ => None,
        }
    }

    /// The first row, when rows were returned.
    pub fn first(&self) -> Option<&Row> {
        self.rows().and_then(|rows| rows.first())
    }

    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            Self::RowsAffected(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_no_connection(&self) -> bool {
        matches!(self, Self::NoConnection)
    }

    /// Short description used in history entries.
    pub fn summary(&self) -> String {
        match self {
            Self::Rows(rows) => format!("{} row(s)", rows.len()),
            Self::NamedRows(rows) => format!("{} row(s)", rows.len()),
            Self::RowsAffected(n) => format!("{} row(s) affected", n),
            Self::NoConnection => "no connection".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::value::Value;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
    }

    #[test]
    fn test_return_shape_parse() {
        assert_eq!("one".parse::<ReturnShape>().unwrap(), ReturnShape::One);
        assert_eq!("fetch_one".parse::<ReturnShape>().unwrap(), ReturnShape::One);
        assert_eq!("Fetch All".parse::<ReturnShape>().unwrap(), ReturnShape::All);
        assert_eq!("1".parse::<ReturnShape>().unwrap(), ReturnShape::One);
        assert_eq!("25".parse::<ReturnShape>().unwrap(), ReturnShape::Many(25));
        assert!("0".parse::<ReturnShape>().is_err());
        assert!("-3".parse::<ReturnShape>().is_err());
        assert!("some".parse::<ReturnShape>().is_err());
    }

    #[test]
    fn test_return_shape_limit() {
        assert_eq!(ReturnShape::One.limit(), Some(1));
        assert_eq!(ReturnShape::Many(4).limit(), Some(4));
        assert_eq!(ReturnShape::All.limit(), None);
        assert!(!ReturnShape::None.returns_rows());
    }

    #[test]
    fn test_query_request_builder() {
        let req = QueryRequest::new("INSERT INTO t VALUES (?, ?)")
            .with_param(1)
            .with_param("x")
            .with_commit(true);
        assert_eq!(
            req.params,
            Params::Single(vec![QueryParam::Int(1), QueryParam::String("x".into())])
        );
        assert!(req.commit);
        assert_eq!(req.mode, AccessMode::Write);
        assert!(!req.strict);
    }

    #[test]
    fn test_bulk_params() {
        let req = QueryRequest::new("INSERT INTO t VALUES (?)")
            .with_params(vec![vec![QueryParam::Int(1)], vec![QueryParam::Int(2)]])
            .with_param(3);
        assert!(req.params.is_bulk());
        assert!(!req.params.is_empty());
    }

    #[test]
    fn test_query_output_accessors() {
        let out = QueryOutput::Rows(vec![vec![Value::Integer(1)]]);
        assert_eq!(out.first(), Some(&vec![Value::Integer(1)]));
        assert_eq!(out.summary(), "1 row(s)");
        assert_eq!(QueryOutput::RowsAffected(3).rows_affected(), Some(3));
        assert!(QueryOutput::NoConnection.is_no_connection());
    }
}
