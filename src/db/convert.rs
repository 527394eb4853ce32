//! Type conversion pipeline for result rows.
//!
//! Engine values are loosely typed, so every row returned to a caller passes
//! through a [`RowConverter`]. Without column tags, integer-looking text is
//! turned into integers ([`convert_default`]). A tag requests a specific type
//! for one column ([`convert_to`]). Conversion never fails: a value that
//! cannot be converted is returned unchanged.

use crate::models::{Row, TypeTag, Value};

/// Automatic conversion applied to untagged columns.
///
/// Text made of an optional leading minus and decimal digits becomes an
/// integer, provided it round-trips exactly (`"007"`, `"-0"` and values
/// outside the `i64` range stay text). Everything else is returned as is.
pub fn convert_default(value: Value) -> Value {
    match value {
        Value::Text(s) => match parse_decimal_integer(&s) {
            Some(n) => Value::Integer(n),
            None => Value::Text(s),
        },
        other => other,
    }
}

fn parse_decimal_integer(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: i64 = s.parse().ok()?;
    (n.to_string() == s).then_some(n)
}

/// Convert `value` to the type named by `tag`.
///
/// `None` means "no conversion". `Null` always passes through.
pub fn convert_to(value: Value, tag: Option<TypeTag>) -> Value {
    let Some(tag) = tag else {
        return value;
    };

    match tag {
        TypeTag::Bool => to_bool(value),
        TypeTag::Int => to_int(value),
        TypeTag::Float => to_float(value),
        TypeTag::Text => to_text(value),
    }
}

fn to_bool(value: Value) -> Value {
    match value {
        Value::Text(s) => match s.as_str() {
            "1" | "true" | "True" | "TRUE" => Value::Bool(true),
            "0" | "false" | "False" | "FALSE" | "" => Value::Bool(false),
            _ => Value::Text(s),
        },
        Value::Integer(n) => Value::Bool(n != 0),
        Value::Real(f) => Value::Bool(f != 0.0),
        other => other,
    }
}

fn to_int(value: Value) -> Value {
    match value {
        Value::Text(s) => match s.trim().parse::<i64>() {
            Ok(n) => Value::Integer(n),
            Err(_) => Value::Text(s),
        },
        Value::Real(f) if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Value::Integer(f.trunc() as i64)
        }
        Value::Bool(b) => Value::Integer(i64::from(b)),
        other => other,
    }
}

fn to_float(value: Value) -> Value {
    match value {
        Value::Text(s) => match s.trim().parse::<f64>() {
            Ok(f) => Value::Real(f),
            Err(_) => Value::Text(s),
        },
        Value::Integer(n) => Value::Real(n as f64),
        Value::Bool(b) => Value::Real(if b { 1.0 } else { 0.0 }),
        other => other,
    }
}

fn to_text(value: Value) -> Value {
    match value {
        Value::Integer(n) => Value::Text(n.to_string()),
        Value::Real(f) => Value::Text(f.to_string()),
        Value::Bool(b) => Value::Text(b.to_string()),
        Value::Blob(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::Text(s),
            Err(e) => Value::Blob(e.into_bytes()),
        },
        other => other,
    }
}

/// Per-query row conversion, built once from the column tags.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RowConverter {
    /// No tags: [`convert_default`] on every column.
    #[default]
    Default,
    /// Tag per column position; positions past the end use the default.
    Typed(Vec<Option<TypeTag>>),
}

impl RowConverter {
    pub fn new(column_types: &[Option<TypeTag>]) -> Self {
        if column_types.is_empty() {
            Self::Default
        } else {
            Self::Typed(column_types.to_vec())
        }
    }

    /// Convert one row. Tags beyond the row width are ignored.
    pub fn convert(&self, row: Row) -> Row {
        match self {
            Self::Default => row.into_iter().map(convert_default).collect(),
            Self::Typed(tags) => row
                .into_iter()
                .enumerate()
                .map(|(idx, value)| match tags.get(idx) {
                    Some(tag) => convert_to(value, *tag),
                    None => convert_default(value),
                })
                .collect(),
        }
    }

    pub fn convert_rows(&self, rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter().map(|row| self.convert(row)).collect()
    }
}

/// Build the converter for an optional tag sequence.
pub fn build_row_converter(column_types: Option<&[Option<TypeTag>]>) -> RowConverter {
    column_types.map(RowConverter::new).unwrap_or_default()
}
