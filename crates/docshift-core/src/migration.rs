//! Versioned migrations.

use crate::ddl::DdlCommand;
use crate::matcher::RowMigrationCommand;

/// A versioned migration.
///
/// Scripted DDL runs whether or not it is safe. Document commands are applied
/// to rows whose version is below `version`.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version (greater than zero, unique).
    pub version: i64,
    /// DDL executed before the automatic diff.
    pub before_auto: Vec<DdlCommand>,
    /// DDL executed after the automatic diff.
    pub after_auto: Vec<DdlCommand>,
    /// Document-level changes.
    pub document_commands: Vec<RowMigrationCommand>,
}

impl Migration {
    /// Create an empty migration.
    pub fn new(version: i64) -> Self {
        Self {
            version,
            before_auto: Vec::new(),
            after_auto: Vec::new(),
            document_commands: Vec::new(),
        }
    }

    /// Add a command to run before the automatic diff.
    pub fn before(mut self, command: DdlCommand) -> Self {
        self.before_auto.push(command);
        self
    }

    /// Add a command to run after the automatic diff.
    pub fn after(mut self, command: DdlCommand) -> Self {
        self.after_auto.push(command);
        self
    }

    /// Add a document change.
    pub fn document(mut self, command: RowMigrationCommand) -> Self {
        self.document_commands.push(command);
        self
    }

    /// Whether the migration changes the schema.
    pub fn has_ddl(&self) -> bool {
        !self.before_auto.is_empty() || !self.after_auto.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, Table};

    #[test]
    fn test_builder() {
        let migration = Migration::new(3)
            .before(DdlCommand::create_table(
                Table::new("Testing").with_column(Column::primary_key("Id", ColumnType::Guid)),
            ))
            .after(DdlCommand::sql("UPDATE \"Testing\" SET \"Id\" = \"Id\""))
            .document(RowMigrationCommand::for_type("Entity"));

        assert_eq!(migration.version, 3);
        assert_eq!(migration.before_auto.len(), 1);
        assert_eq!(migration.after_auto.len(), 1);
        assert_eq!(migration.document_commands[0].type_filter(), Some("Entity"));
        assert!(migration.has_ddl());
        assert!(!Migration::new(4).has_ddl());
    }
}
