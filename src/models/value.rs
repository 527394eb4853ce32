//! Column values and per-column type tags.
//!
//! SQLite is loosely typed: a column declared INTEGER can hold text, and
//! booleans are stored as integers or strings. [`Value`] carries whatever
//! storage class the engine returned, plus `Bool` which only appears after
//! an explicit conversion.

use serde::Serialize;
use serde::ser::SerializeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DbError;

/// A single column value as returned by the engine or produced by conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(serialize_with = "serialize_blob")]
    Blob(Vec<u8>),
    Bool(bool),
}

#[allow(clippy::ptr_arg)]
fn serialize_blob<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// One result row, in column order.
pub type Row = Vec<Value>;

/// A result row keyed by column name. Serializes as a JSON object in
/// column order.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedRow {
    columns: Vec<(String, Value)>,
}

impl NamedRow {
    /// Pair `names` with `values` by position; extra entries on either side
    /// are dropped.
    pub fn new(names: &[String], values: Row) -> Self {
        Self {
            columns: names.iter().cloned().zip(values).collect(),
        }
    }

    /// Value of the first column called `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn into_row(self) -> Row {
        self.columns.into_iter().map(|(_, value)| value).collect()
    }
}

impl Serialize for NamedRow {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the storage class name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
            Self::Bool(_) => "bool",
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Blob(bytes)
    }
}

/// Requested semantic type for one column.
///
/// A column-type sequence is `Vec<Option<TypeTag>>`; `None` at a position
/// suppresses automatic conversion for that column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Bool,
    Int,
    Float,
    Text,
}

impl TypeTag {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
        }
    }

    /// Parse a tag sequence such as `["none", "bool"]`.
    ///
    /// `"none"` (or an empty string) yields the explicit no-conversion tag.
    pub fn parse_sequence<I, S>(names: I) -> Result<Vec<Option<TypeTag>>, DbError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| {
                let name = name.as_ref().trim();
                if name.is_empty() || name.eq_ignore_ascii_case("none") {
                    Ok(None)
                } else {
                    name.parse().map(Some)
                }
            })
            .collect()
    }
}

impl FromStr for TypeTag {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(Self::Bool),
            "int" | "integer" => Ok(Self::Int),
            "float" | "real" => Ok(Self::Float),
            "str" | "text" | "string" => Ok(Self::Text),
            other => Err(DbError::validation(format!("Unknown type tag: '{}'", other))),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
