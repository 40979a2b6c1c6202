//! Engine configuration.
//!
//! [`Configuration`] is the validated document model: desired tables in
//! declaration order, document designs, and the registered migrations.
//! [`MigrationConfig`] and [`SweepConfig`] tune the schema pass and the
//! background sweep.

use crate::error::ConfigError;
use crate::migration::Migration;
use crate::registry::{DocumentDesign, DocumentRegistry, Projection};
use crate::schema::Table;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Whether tables are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TableMode {
    /// Regular tables.
    #[default]
    RealTables,
    /// Connection-scoped temporary tables. Scripted migrations are skipped.
    TempTables,
}

/// Schema pass configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// How long to wait for the migration lock.
    pub lock_timeout_ms: u64,
    /// Table mode.
    pub table_mode: TableMode,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 60_000,
            table_mode: TableMode::RealTables,
        }
    }
}

impl MigrationConfig {
    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the table mode.
    pub fn with_table_mode(mut self, mode: TableMode) -> Self {
        self.table_mode = mode;
        self
    }

    /// Lock timeout as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// How long the background sweep keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SweepMode {
    /// Sweep until no table has flagged rows, then stop.
    #[default]
    Once,
    /// Keep polling for newly flagged rows until cancelled.
    Continuous,
}

/// Background sweep configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Rows per batch.
    pub batch_size: usize,
    /// Wait before retrying a batch after a transient fault.
    pub retry_backoff_ms: u64,
    /// Wait between passes in continuous mode.
    pub poll_interval_ms: u64,
    /// Run mode.
    pub mode: SweepMode,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry_backoff_ms: 1_000,
            poll_interval_ms: 5_000,
            mode: SweepMode::Once,
        }
    }
}

impl SweepConfig {
    /// Set the batch size (at least one).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the run mode.
    pub fn with_mode(mut self, mode: SweepMode) -> Self {
        self.mode = mode;
        self
    }

    /// Retry backoff as a duration.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The validated document model.
#[derive(Debug, Clone)]
pub struct Configuration {
    tables: Vec<Table>,
    registry: DocumentRegistry,
    migrations: Vec<Migration>,
    configured_version: i64,
}

impl Configuration {
    /// Start building a configuration.
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Desired tables in declaration order.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Document tables in declaration order.
    pub fn document_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| t.is_document())
    }

    /// The document registry.
    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    /// Migrations in ascending version order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Migrations newer than `version`, ascending.
    pub fn migrations_after(&self, version: i64) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(move |m| m.version > version)
    }

    /// Highest registered migration version, or 0 with none registered.
    pub fn configured_version(&self) -> i64 {
        self.configured_version
    }
}

/// Builds and validates a [`Configuration`].
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    tables: Vec<Table>,
    designs: Vec<DocumentDesign>,
    migrations: Vec<Migration>,
}

impl ConfigurationBuilder {
    /// Declare a table.
    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    /// Declare a document type. Its table is created as a document table
    /// when not declared explicitly.
    pub fn document(mut self, design: DocumentDesign) -> Self {
        self.designs.push(design);
        self
    }

    /// Register a migration.
    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<Configuration, ConfigError> {
        let mut tables = self.tables;
        let designs = inherit_projections(self.designs);

        let mut seen = HashSet::new();
        for table in &tables {
            if !seen.insert(table.name.to_ascii_lowercase()) {
                return Err(ConfigError::DuplicateTable(table.name.clone()));
            }
        }

        let mut types = HashSet::new();
        let mut discriminators = HashSet::new();
        for design in &designs {
            if !types.insert(design.type_name.clone()) {
                return Err(ConfigError::DuplicateType(design.type_name.clone()));
            }
            if !discriminators.insert((
                design.table.to_ascii_lowercase(),
                design.discriminator.clone(),
            )) {
                return Err(ConfigError::DuplicateDiscriminator {
                    table: design.table.clone(),
                    discriminator: design.discriminator.clone(),
                });
            }

            let idx = match tables
                .iter()
                .position(|t| t.name.eq_ignore_ascii_case(&design.table))
            {
                Some(idx) => idx,
                None => {
                    tables.push(Table::document(design.table.clone()));
                    tables.len() - 1
                }
            };
            let table = &mut tables[idx];
            if !table.is_document() {
                return Err(ConfigError::NotADocumentTable {
                    type_name: design.type_name.clone(),
                    table: design.table.clone(),
                });
            }
            for projection in &design.projections {
                table.add_column(projection.column.clone());
            }
        }

        for design in &designs {
            if let Some(parent) = &design.parent {
                if !types.contains(parent) {
                    return Err(ConfigError::UnknownParent {
                        type_name: design.type_name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        let mut migrations = self.migrations;
        migrations.sort_by_key(|m| m.version);
        for (idx, migration) in migrations.iter().enumerate() {
            if migration.version <= 0 {
                return Err(ConfigError::InvalidVersion(migration.version));
            }
            if idx > 0 && migrations[idx - 1].version == migration.version {
                return Err(ConfigError::DuplicateVersion(migration.version));
            }
            for command in &migration.document_commands {
                if let Some(filter) = command.type_filter() {
                    if !types.contains(filter) {
                        return Err(ConfigError::UnknownTypeFilter {
                            version: migration.version,
                            type_name: filter.to_string(),
                        });
                    }
                }
            }
        }

        let configured_version = migrations.last().map(|m| m.version).unwrap_or(0);

        Ok(Configuration {
            tables,
            registry: DocumentRegistry::new(designs),
            migrations,
            configured_version,
        })
    }
}

/// Append the projections of every ancestor that a design does not
/// declare itself. Subtypes share their parent's table, so their rows must
/// fill the parent's columns too.
fn inherit_projections(designs: Vec<DocumentDesign>) -> Vec<DocumentDesign> {
    let parents: HashMap<String, Option<String>> = designs
        .iter()
        .map(|d| (d.type_name.clone(), d.parent.clone()))
        .collect();
    let own: HashMap<String, Vec<Projection>> = designs
        .iter()
        .map(|d| (d.type_name.clone(), d.projections.clone()))
        .collect();

    designs
        .into_iter()
        .map(|mut design| {
            let mut current = design.parent.clone();
            // Bounded walk; a parent cycle cannot loop forever.
            for _ in 0..parents.len() {
                let Some(ancestor) = current else { break };
                for projection in own.get(&ancestor).into_iter().flatten() {
                    let declared = design
                        .projections
                        .iter()
                        .any(|p| p.column.name.eq_ignore_ascii_case(&projection.column.name));
                    if !declared {
                        design.projections.push(projection.clone());
                    }
                }
                current = parents.get(&ancestor).cloned().flatten();
            }
            design
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::RowMigrationCommand;
    use crate::sql::SqlValue;
    use crate::schema::{Column, ColumnType};

    #[test]
    fn test_defaults() {
        let migration = MigrationConfig::default();
        assert_eq!(migration.lock_timeout(), Duration::from_secs(60));
        assert_eq!(migration.table_mode, TableMode::RealTables);

        let sweep = SweepConfig::default();
        assert_eq!(sweep.batch_size, 500);
        assert_eq!(sweep.retry_backoff(), Duration::from_secs(1));
        assert_eq!(sweep.mode, SweepMode::Once);
    }

    #[test]
    fn test_builders() {
        let sweep = SweepConfig::default()
            .with_batch_size(0)
            .with_retry_backoff(Duration::from_millis(5))
            .with_mode(SweepMode::Continuous);
        assert_eq!(sweep.batch_size, 1);
        assert_eq!(sweep.retry_backoff_ms, 5);
        assert_eq!(sweep.mode, SweepMode::Continuous);

        let migration = MigrationConfig::default()
            .with_lock_timeout(Duration::from_millis(250))
            .with_table_mode(TableMode::TempTables);
        assert_eq!(migration.lock_timeout_ms, 250);
        assert_eq!(migration.table_mode, TableMode::TempTables);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let sweep: SweepConfig = serde_json::from_str(r#"{"batch_size": 10}"#).unwrap();
        assert_eq!(sweep.batch_size, 10);
        assert_eq!(sweep.retry_backoff_ms, 1_000);

        let migration: MigrationConfig =
            serde_json::from_str(r#"{"table_mode": "TempTables"}"#).unwrap();
        assert_eq!(migration.table_mode, TableMode::TempTables);
        assert_eq!(migration.lock_timeout_ms, 60_000);
    }

    #[test]
    fn test_document_creates_table_with_projections() {
        let config = Configuration::builder()
            .table(Table::new("Testing").with_column(Column::primary_key("Id", ColumnType::Guid)))
            .document(DocumentDesign::new("Entity", "Entities").with_projection(
                Projection::pointer(Column::new("Name", ColumnType::Text), "/name"),
            ))
            .build()
            .unwrap();

        let names: Vec<&str> = config.tables().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Testing", "Entities"]);
        let entities = config.table("Entities").unwrap();
        assert!(entities.is_document());
        assert!(entities.column("Name").is_some());
        assert_eq!(config.document_tables().count(), 1);
        assert_eq!(config.configured_version(), 0);
    }

    #[test]
    fn test_subtypes_inherit_projections() {
        let config = Configuration::builder()
            .document(
                DocumentDesign::new("Entity", "Entities")
                    .with_projection(Projection::pointer(
                        Column::new("Name", ColumnType::Text),
                        "/name",
                    ))
                    .with_projection(Projection::pointer(
                        Column::new("Size", ColumnType::Integer),
                        "/size",
                    )),
            )
            .document(
                DocumentDesign::new("SpecialEntity", "Entities")
                    .extends("Entity")
                    .with_projection(Projection::pointer(
                        Column::new("Size", ColumnType::Integer),
                        "/special/size",
                    )),
            )
            .document(DocumentDesign::new("VerySpecialEntity", "Entities").extends("SpecialEntity"))
            .build()
            .unwrap();

        let doc = serde_json::json!({"name": "x", "size": 1, "special": {"size": 2}});
        let registry = config.registry();

        let special = registry.design("SpecialEntity").unwrap().project(&doc);
        assert_eq!(special.len(), 2);
        assert!(special.contains(&("Size".to_string(), SqlValue::Integer(2))));
        assert!(special.contains(&("Name".to_string(), SqlValue::Text("x".to_string()))));

        let very = registry.design("VerySpecialEntity").unwrap().project(&doc);
        assert_eq!(very.len(), 2);
        assert!(very.contains(&("Size".to_string(), SqlValue::Integer(2))));
        assert!(very.contains(&("Name".to_string(), SqlValue::Text("x".to_string()))));

        assert_eq!(registry.design("Entity").unwrap().projections.len(), 2);
    }

    #[test]
    fn test_migrations_are_sorted() {
        let config = Configuration::builder()
            .migration(Migration::new(3))
            .migration(Migration::new(1))
            .migration(Migration::new(2))
            .build()
            .unwrap();

        let versions: Vec<i64> = config.migrations().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(config.configured_version(), 3);
        assert_eq!(config.migrations_after(1).count(), 2);
    }

    #[test]
    fn test_validation_errors() {
        let err = Configuration::builder()
            .table(Table::new("A"))
            .table(Table::new("a"))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateTable("a".to_string()));

        let err = Configuration::builder()
            .table(Table::new("Plain"))
            .document(DocumentDesign::new("Entity", "Plain"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotADocumentTable { .. }));

        let err = Configuration::builder()
            .document(DocumentDesign::new("A", "Docs").with_discriminator("X"))
            .document(DocumentDesign::new("B", "Docs").with_discriminator("X"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDiscriminator { .. }));

        let err = Configuration::builder()
            .document(DocumentDesign::new("A", "Docs").extends("Missing"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownParent { .. }));

        let err = Configuration::builder()
            .migration(Migration::new(0))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidVersion(0));

        let err = Configuration::builder()
            .migration(Migration::new(2))
            .migration(Migration::new(2))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateVersion(2));

        let err = Configuration::builder()
            .migration(Migration::new(1).document(RowMigrationCommand::for_type("Ghost")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTypeFilter { version: 1, .. }));
    }
}
