//! Schema change commands.
//!
//! A [`DdlCommand`] is either computed by the [`SchemaDiffer`](crate::diff::SchemaDiffer)
//! or scripted by a [`Migration`](crate::migration::Migration). Only safe commands
//! are executed automatically; scripted commands always run.

use crate::config::TableMode;
use crate::schema::{Column, Table};
use crate::sql::quote_ident;

/// The operation a command performs.
#[derive(Debug, Clone, PartialEq)]
pub enum DdlKind {
    /// Create a table with all its columns.
    CreateTable(Table),
    /// Add a column to an existing table.
    AddColumn {
        /// Target table.
        table: String,
        /// Column to add.
        column: Column,
    },
    /// Drop a column.
    RemoveColumn {
        /// Target table.
        table: String,
        /// Column to drop.
        column: String,
    },
    /// Drop a table.
    RemoveTable {
        /// Table to drop.
        table: String,
    },
    /// Rename a table.
    RenameTable {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Rename a column.
    RenameColumn {
        /// Target table.
        table: String,
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Raw SQL escape hatch.
    RawSql {
        /// Statement(s) to execute.
        sql: String,
        /// Human-readable description.
        description: String,
    },
}

/// A schema change command.
#[derive(Debug, Clone, PartialEq)]
pub struct DdlCommand {
    /// The operation.
    pub kind: DdlKind,
    /// Whether the command may run automatically.
    pub safe: bool,
    /// Table whose rows need their projections recomputed afterwards.
    pub reprojection_target: Option<String>,
}

impl DdlCommand {
    fn new(kind: DdlKind) -> Self {
        Self {
            kind,
            safe: false,
            reprojection_target: None,
        }
    }

    /// Create a table.
    pub fn create_table(table: Table) -> Self {
        Self::new(DdlKind::CreateTable(table))
    }

    /// Add a column.
    pub fn add_column(table: impl Into<String>, column: Column) -> Self {
        Self::new(DdlKind::AddColumn {
            table: table.into(),
            column,
        })
    }

    /// Remove a column.
    pub fn remove_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(DdlKind::RemoveColumn {
            table: table.into(),
            column: column.into(),
        })
    }

    /// Remove a table.
    pub fn remove_table(table: impl Into<String>) -> Self {
        Self::new(DdlKind::RemoveTable {
            table: table.into(),
        })
    }

    /// Rename a table.
    pub fn rename_table(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(DdlKind::RenameTable {
            from: from.into(),
            to: to.into(),
        })
    }

    /// Rename a column.
    pub fn rename_column(
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::new(DdlKind::RenameColumn {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        })
    }

    /// Raw SQL.
    pub fn sql(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self::new(DdlKind::RawSql {
            description: sql.clone(),
            sql,
        })
    }

    /// Mark the command as safe to run automatically.
    pub fn mark_safe(mut self) -> Self {
        self.safe = true;
        self
    }

    /// Request reprojection of a table after the command runs.
    pub fn with_reprojection(mut self, table: impl Into<String>) -> Self {
        self.reprojection_target = Some(table.into());
        self
    }

    /// Replace the description of a raw SQL command.
    pub fn described_as(mut self, text: impl Into<String>) -> Self {
        if let DdlKind::RawSql { description, .. } = &mut self.kind {
            *description = text.into();
        }
        self
    }

    /// Check if the command destroys data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self.kind,
            DdlKind::RemoveColumn { .. } | DdlKind::RemoveTable { .. }
        )
    }

    /// Render the command as SQLite statements.
    pub fn to_sql(&self, mode: TableMode) -> String {
        match &self.kind {
            DdlKind::CreateTable(table) => {
                let temp = match mode {
                    TableMode::RealTables => "",
                    TableMode::TempTables => "TEMP ",
                };
                let columns: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| column_definition(c, false))
                    .collect();
                format!(
                    "CREATE {}TABLE {} ({})",
                    temp,
                    quote_ident(&table.name),
                    columns.join(", ")
                )
            }
            DdlKind::AddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_definition(column, true)
            ),
            DdlKind::RemoveColumn { table, column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
            DdlKind::RemoveTable { table } => format!("DROP TABLE {}", quote_ident(table)),
            DdlKind::RenameTable { from, to } => format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ),
            DdlKind::RenameColumn { table, from, to } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(from),
                quote_ident(to)
            ),
            DdlKind::RawSql { sql, .. } => sql.clone(),
        }
    }
}

impl std::fmt::Display for DdlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DdlKind::CreateTable(table) => write!(f, "create table {}", table.name),
            DdlKind::AddColumn { table, column } => {
                write!(f, "add column {}.{}", table, column.name)
            }
            DdlKind::RemoveColumn { table, column } => {
                write!(f, "remove column {}.{}", table, column)
            }
            DdlKind::RemoveTable { table } => write!(f, "remove table {}", table),
            DdlKind::RenameTable { from, to } => write!(f, "rename table {} to {}", from, to),
            DdlKind::RenameColumn { table, from, to } => {
                write!(f, "rename column {}.{} to {}", table, from, to)
            }
            DdlKind::RawSql { description, .. } => write!(f, "sql: {}", description),
        }
    }
}

fn column_definition(column: &Column, adding: bool) -> String {
    let mut definition = format!(
        "{} {}",
        quote_ident(&column.name),
        column.column_type.sql_type()
    );
    if column.primary_key {
        definition.push_str(" NOT NULL PRIMARY KEY");
    } else if !column.nullable && (!adding || column.default.is_some()) {
        // ADD COLUMN rejects NOT NULL without a default
        definition.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        definition.push_str(" DEFAULT ");
        definition.push_str(&default.to_literal());
    }
    definition
}
