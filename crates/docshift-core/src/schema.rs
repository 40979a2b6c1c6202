//! Desired and actual relational schema.

use crate::sql::SqlValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Standard columns of every document table.
pub mod columns {
    /// Primary key.
    pub const ID: &str = "Id";
    /// Optimistic concurrency token.
    pub const ETAG: &str = "Etag";
    /// Insert timestamp (RFC 3339).
    pub const CREATED_AT: &str = "CreatedAt";
    /// Last write timestamp (RFC 3339).
    pub const MODIFIED_AT: &str = "ModifiedAt";
    /// Concrete type tag of the stored document.
    pub const DISCRIMINATOR: &str = "Discriminator";
    /// Version of the serialized document.
    pub const VERSION: &str = "Version";
    /// Set when the row awaits migration or reprojection.
    pub const AWAITS_REPROJECTION: &str = "AwaitsReprojection";
    /// Serialized document payload.
    pub const DOCUMENT: &str = "Document";
}

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// UTF-8 text.
    Text,
    /// 64-bit integer.
    Integer,
    /// Floating point.
    Real,
    /// Boolean (stored as integer).
    Boolean,
    /// Binary data.
    Blob,
    /// UUID (stored as text).
    Guid,
    /// Timestamp (stored as RFC 3339 text).
    DateTime,
}

impl ColumnType {
    /// SQLite storage type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Guid | ColumnType::DateTime => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// A column declaration.
///
/// Columns compare by name only; type changes are not detected when diffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub column_type: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default value for new rows.
    pub default: Option<SqlValue>,
    /// Whether the column is the primary key.
    pub primary_key: bool,
}

impl Column {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            primary_key: false,
        }
    }

    /// Create a primary key column.
    pub fn primary_key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            primary_key: true,
        }
    }

    /// Disallow NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: impl Into<SqlValue>) -> Self {
        self.default = Some(default.into());
        self
    }
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Column {}

/// Whether a table stores documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Plain relational table.
    Plain,
    /// Document table with the standard document columns.
    Document,
}

/// A table declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Table name (unique).
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<Column>,
    /// Table kind.
    pub kind: TableKind,
}

impl Table {
    /// Create an empty plain table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            kind: TableKind::Plain,
        }
    }

    /// Create a document table with the standard columns.
    pub fn document(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![
                Column::primary_key(columns::ID, ColumnType::Text),
                Column::new(columns::ETAG, ColumnType::Text),
                Column::new(columns::CREATED_AT, ColumnType::DateTime),
                Column::new(columns::MODIFIED_AT, ColumnType::DateTime),
                Column::new(columns::DISCRIMINATOR, ColumnType::Text),
                Column::new(columns::VERSION, ColumnType::Integer)
                    .not_null()
                    .with_default(0i64),
                Column::new(columns::AWAITS_REPROJECTION, ColumnType::Boolean)
                    .not_null()
                    .with_default(false),
                Column::new(columns::DOCUMENT, ColumnType::Text),
            ],
            kind: TableKind::Document,
        }
    }

    /// Add a column. A column with the same name is replaced.
    pub fn with_column(mut self, column: Column) -> Self {
        self.add_column(column);
        self
    }

    /// Add a column in place. A column with the same name is replaced.
    pub fn add_column(&mut self, column: Column) {
        match self.columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(&column.name)) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Check if this is a document table.
    pub fn is_document(&self) -> bool {
        self.kind == TableKind::Document
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// The schema as it exists in the database: table name to column names.
///
/// Name lookups are ASCII case-insensitive, matching SQL identifier rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualSchema {
    tables: BTreeMap<String, Vec<String>>,
}

impl ActualSchema {
    /// An empty schema.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a table with its columns.
    pub fn with_table<I, C>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.insert(name, columns.into_iter().map(Into::into).collect());
        self
    }

    /// Add or replace a table.
    pub fn insert(&mut self, name: impl Into<String>, columns: Vec<String>) {
        self.tables.insert(name.into(), columns);
    }

    /// Remove a table, returning its columns.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let key = self.find(name).map(|(k, _)| k.clone())?;
        self.tables.remove(&key)
    }

    /// Check whether a table exists.
    pub fn contains_table(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Column names of a table.
    pub fn columns(&self, name: &str) -> Option<&[String]> {
        self.find(name).map(|(_, cols)| cols.as_slice())
    }

    /// Check whether a table has a column.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns(table)
            .map(|cols| cols.iter().any(|c| c.eq_ignore_ascii_case(column)))
            .unwrap_or(false)
    }

    /// Iterate tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if there are no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn find(&self, name: &str) -> Option<(&String, &Vec<String>)> {
        self.tables
            .get_key_value(name)
            .or_else(|| self.tables.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)))
    }
}
