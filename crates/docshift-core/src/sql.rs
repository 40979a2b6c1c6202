//! SQL values and composable statement fragments.
//!
//! Fragments use positional `?` placeholders; composing fragments keeps
//! their parameters in placeholder order.

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

/// A single SQL parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean, stored as 0/1.
    Bool(bool),
    /// 64-bit integer.
    Integer(i64),
    /// Floating point.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary data.
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Check if the value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Borrow the value as text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Read the value as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Read the value as a boolean (any non-zero integer is true).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Render the value as a SQL literal, for DDL defaults.
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => (*b as i64).to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(f) => format!("{:?}", f),
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Blob(b) => format!("X'{}'", hex::encode(b)),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(*b as i64)),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A piece of SQL with its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlFragment {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    /// Create a fragment.
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A predicate that is always true.
    pub fn always() -> Self {
        Self::new("1 = 1", Vec::new())
    }

    /// A predicate that is never true.
    pub fn never() -> Self {
        Self::new("1 = 0", Vec::new())
    }

    /// AND-combine predicates. An empty input is always true.
    pub fn and_all(parts: impl IntoIterator<Item = SqlFragment>) -> Self {
        Self::join(parts, " AND ").unwrap_or_else(Self::always)
    }

    /// OR-combine predicates. An empty input is never true.
    pub fn or_any(parts: impl IntoIterator<Item = SqlFragment>) -> Self {
        Self::join(parts, " OR ").unwrap_or_else(Self::never)
    }

    fn join(parts: impl IntoIterator<Item = SqlFragment>, separator: &str) -> Option<Self> {
        let mut sql = Vec::new();
        let mut params = Vec::new();
        for part in parts {
            sql.push(format!("({})", part.sql));
            params.extend(part.params);
        }

        if sql.is_empty() {
            None
        } else {
            Some(Self::new(sql.join(separator), params))
        }
    }
}

/// Quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
