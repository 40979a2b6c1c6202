//! Schema diffing algorithm.
//!
//! Compares the schema found in the database with the declared tables and
//! produces the commands that reconcile them. Creates and adds come first, in
//! declaration order; removals follow in a second pass over the actual tables.

use crate::ddl::DdlCommand;
use crate::schema::{ActualSchema, Table};

/// Computes schema changes.
pub struct SchemaDiffer;

impl SchemaDiffer {
    /// Compute the commands that turn `actual` into `desired`.
    ///
    /// Additions are marked safe. Document tables that gain columns request
    /// reprojection of their rows. Removals are never safe. Column type
    /// changes are not detected.
    pub fn diff(actual: &ActualSchema, desired: &[Table]) -> Vec<DdlCommand> {
        let mut commands = Vec::new();

        for table in desired {
            match actual.columns(&table.name) {
                None => {
                    commands.push(DdlCommand::create_table(table.clone()).mark_safe());
                }
                Some(existing) => {
                    for column in &table.columns {
                        if existing.iter().any(|c| c.eq_ignore_ascii_case(&column.name)) {
                            continue;
                        }

                        let mut cmd =
                            DdlCommand::add_column(&table.name, column.clone()).mark_safe();
                        if table.is_document() {
                            cmd = cmd.with_reprojection(&table.name);
                        }
                        commands.push(cmd);
                    }
                }
            }
        }

        for (name, existing) in actual.tables() {
            match desired.iter().find(|t| t.name.eq_ignore_ascii_case(name)) {
                None => commands.push(DdlCommand::remove_table(name)),
                Some(table) => {
                    for column in existing {
                        if table.column(column).is_none() {
                            commands.push(DdlCommand::remove_column(&table.name, column));
                        }
                    }
                }
            }
        }

        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::DdlKind;
    use crate::schema::{Column, ColumnType};

    fn testing_table() -> Table {
        Table::new("Testing").with_column(Column::primary_key("Id", ColumnType::Guid))
    }

    #[test]
    fn test_diff_create_table() {
        let commands = SchemaDiffer::diff(&ActualSchema::empty(), &[testing_table()]);

        assert_eq!(commands.len(), 1);
        assert!(commands[0].safe);
        match &commands[0].kind {
            DdlKind::CreateTable(t) => assert_eq!(t.name, "Testing"),
            other => panic!("Expected CreateTable, got {:?}", other),
        }
    }

    #[test]
    fn test_diff_add_column_to_plain_table() {
        let actual = ActualSchema::empty().with_table("Testing", ["Id"]);
        let desired = testing_table().with_column(Column::new("Noget", ColumnType::Integer));

        let commands = SchemaDiffer::diff(&actual, &[desired]);

        assert_eq!(commands.len(), 1);
        assert!(commands[0].safe);
        assert!(commands[0].reprojection_target.is_none());
        match &commands[0].kind {
            DdlKind::AddColumn { table, column } => {
                assert_eq!(table, "Testing");
                assert_eq!(column.name, "Noget");
            }
            other => panic!("Expected AddColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_diff_add_column_to_document_table_requests_reprojection() {
        let existing = Table::document("Entities");
        let actual = ActualSchema::empty().with_table(
            "Entities",
            existing.column_names().map(String::from).collect::<Vec<_>>(),
        );
        let desired = Table::document("Entities").with_column(Column::new("NewCol", ColumnType::Text));

        let commands = SchemaDiffer::diff(&actual, &[desired]);

        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].reprojection_target.as_deref(), Some("Entities"));
    }

    #[test]
    fn test_diff_removals_are_unsafe() {
        let actual = ActualSchema::empty()
            .with_table("Testing", ["Id", "Old"])
            .with_table("Legacy", ["Id"]);

        let commands = SchemaDiffer::diff(&actual, &[testing_table()]);

        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| !c.safe));
        assert!(commands.iter().all(|c| c.is_destructive()));
        assert!(commands.iter().any(|c| matches!(
            &c.kind,
            DdlKind::RemoveColumn { table, column } if table == "Testing" && column == "Old"
        )));
        assert!(commands.iter().any(|c| matches!(
            &c.kind,
            DdlKind::RemoveTable { table } if table == "Legacy"
        )));
    }

    #[test]
    fn test_diff_orders_additions_before_removals() {
        let actual = ActualSchema::empty()
            .with_table("Alpha", ["Id"])
            .with_table("Zulu", ["Id", "Gone"]);
        let desired = vec![
            Table::new("Zulu").with_column(Column::primary_key("Id", ColumnType::Text)),
            Table::new("Beta").with_column(Column::primary_key("Id", ColumnType::Text)),
            Table::new("Alpha")
                .with_column(Column::primary_key("Id", ColumnType::Text))
                .with_column(Column::new("Added", ColumnType::Integer)),
        ];

        let commands = SchemaDiffer::diff(&actual, &desired);
        let rendered: Vec<String> = commands.iter().map(|c| c.to_string()).collect();

        assert_eq!(
            rendered,
            vec![
                "create table Beta",
                "add column Alpha.Added",
                "remove column Zulu.Gone",
            ]
        );
    }

    #[test]
    fn test_diff_ignores_case_and_type_changes() {
        let actual = ActualSchema::empty().with_table("testing", ["ID", "noget"]);
        let desired = testing_table().with_column(Column::new("Noget", ColumnType::Text));

        assert!(SchemaDiffer::diff(&actual, &[desired]).is_empty());
    }

    #[test]
    fn test_diff_no_changes() {
        let actual = ActualSchema::empty().with_table("Testing", ["Id"]);
        assert!(SchemaDiffer::diff(&actual, &[testing_table()]).is_empty());
    }
}
