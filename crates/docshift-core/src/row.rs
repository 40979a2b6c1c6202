//! Materialized table rows.

use crate::error::MigrationError;
use crate::schema::columns;
use crate::sql::SqlValue;
use std::collections::BTreeMap;

/// A row read from a table, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<String, SqlValue>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        self.values.insert(column.into(), value);
    }

    /// Set a column value, builder style.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value.into());
        self
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    /// Get a text column.
    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    /// Get an integer column.
    pub fn integer(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    /// Get a boolean column.
    pub fn boolean(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(SqlValue::as_bool)
    }

    /// Iterate columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The document columns of a row in a document table.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    /// Document id.
    pub id: String,
    /// Concrete type tag.
    pub discriminator: String,
    /// Version of the serialized document.
    pub version: i64,
    /// Whether the row awaits migration or reprojection.
    pub awaits_reprojection: bool,
    /// Serialized document.
    pub document: String,
    /// Concurrency token.
    pub etag: String,
}

impl DocumentRow {
    /// Extract the document columns from a row of `table`.
    pub fn from_row(table: &str, row: &Row) -> Result<Self, MigrationError> {
        let missing = |column: &str| MigrationError::MalformedRow {
            table: table.to_string(),
            reason: format!("missing or invalid column '{}'", column),
        };

        Ok(Self {
            id: row.text(columns::ID).ok_or_else(|| missing(columns::ID))?.to_string(),
            discriminator: row
                .text(columns::DISCRIMINATOR)
                .ok_or_else(|| missing(columns::DISCRIMINATOR))?
                .to_string(),
            version: row
                .integer(columns::VERSION)
                .ok_or_else(|| missing(columns::VERSION))?,
            awaits_reprojection: row.boolean(columns::AWAITS_REPROJECTION).unwrap_or(false),
            document: row
                .text(columns::DOCUMENT)
                .ok_or_else(|| missing(columns::DOCUMENT))?
                .to_string(),
            etag: row.text(columns::ETAG).unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity_row() -> Row {
        Row::new()
            .with(columns::ID, "e1")
            .with(columns::DISCRIMINATOR, "Entity")
            .with(columns::VERSION, 2i64)
            .with(columns::AWAITS_REPROJECTION, SqlValue::Integer(1))
            .with(columns::DOCUMENT, "{}")
            .with(columns::ETAG, "abc")
    }

    #[test]
    fn test_document_row_from_row() {
        let row = DocumentRow::from_row("Entities", &entity_row()).unwrap();

        assert_eq!(row.id, "e1");
        assert_eq!(row.discriminator, "Entity");
        assert_eq!(row.version, 2);
        assert!(row.awaits_reprojection);
        assert_eq!(row.etag, "abc");
    }

    #[test]
    fn test_document_row_missing_column() {
        let row = Row::new().with(columns::ID, "e1");
        let err = DocumentRow::from_row("Entities", &row).unwrap_err();

        assert!(matches!(err, MigrationError::MalformedRow { .. }));
        assert!(err.to_string().contains("Discriminator"));
    }
}
