//! Per-document migration.
//!
//! Upgrades one persisted document from its recorded version to the
//! configured version by applying, in ascending migration order, every
//! document command that accepts the row.

use crate::backup::{backup_name, BackupWriter};
use crate::config::Configuration;
use crate::error::MigrationError;
use crate::registry::DocumentDesign;
use crate::row::DocumentRow;
use crate::serializer::{self, Serializer};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// A document after migration.
#[derive(Debug, Clone)]
pub struct MigratedRow {
    /// The row with its document and version updated.
    pub row: DocumentRow,
    /// The parsed document.
    pub document: Value,
    /// Version the row had before migration.
    pub from_version: i64,
    /// Number of document commands applied.
    pub applied: usize,
}

impl MigratedRow {
    /// Whether the stored row is out of date.
    pub fn needs_write(&self) -> bool {
        self.from_version != self.row.version
    }
}

/// Applies document migrations to single rows.
pub struct DocumentMigrator {
    config: Arc<Configuration>,
    serializer: Arc<dyn Serializer>,
    backup: Arc<dyn BackupWriter>,
}

impl DocumentMigrator {
    /// Create a migrator.
    pub fn new(
        config: Arc<Configuration>,
        serializer: Arc<dyn Serializer>,
        backup: Arc<dyn BackupWriter>,
    ) -> Self {
        Self {
            config,
            serializer,
            backup,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// A shared handle to the configuration.
    pub fn shared_config(&self) -> Arc<Configuration> {
        Arc::clone(&self.config)
    }

    /// The serializer.
    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    /// Migrate a row of `design` to the configured version.
    pub fn migrate(
        &self,
        design: &DocumentDesign,
        mut row: DocumentRow,
    ) -> Result<MigratedRow, MigrationError> {
        let configured = self.config.configured_version();
        if row.version > configured {
            return Err(MigrationError::DocumentAhead {
                type_name: design.type_name.clone(),
                id: row.id.clone(),
                version: row.version,
                configured,
            });
        }

        let registry = self.config.registry();
        let from_version = row.version;
        let mut payload = row.document.clone();
        let mut applied = 0;
        let mut backed_up = false;

        for migration in self.config.migrations_after(from_version) {
            for command in &migration.document_commands {
                if !command.matches(migration.version, registry, &design.table, &row) {
                    continue;
                }

                if command.has_change() && !backed_up {
                    self.write_backup(design, &row.id, from_version, &payload);
                    backed_up = true;
                }

                payload = command
                    .execute(self.serializer.as_ref(), &payload)
                    .map_err(|reason| MigrationError::DocumentChange {
                        type_name: design.type_name.clone(),
                        id: row.id.clone(),
                        version: migration.version,
                        reason,
                    })?;
                applied += 1;

                debug!(
                    type_name = %design.type_name,
                    id = %row.id,
                    version = migration.version,
                    "Applied document change"
                );
            }
        }

        let document = self.serializer.from_text(&payload)?;
        row.document = payload;
        row.version = configured;

        Ok(MigratedRow {
            row,
            document,
            from_version,
            applied,
        })
    }

    /// Migrate a row and deserialize the result.
    pub fn deserialize_and_migrate<T: DeserializeOwned>(
        &self,
        design: &DocumentDesign,
        row: DocumentRow,
    ) -> Result<(T, MigratedRow), MigrationError> {
        let migrated = self.migrate(design, row)?;
        let entity = serializer::from_value(migrated.document.clone())?;
        Ok((entity, migrated))
    }

    fn write_backup(&self, design: &DocumentDesign, id: &str, from_version: i64, payload: &str) {
        let name = backup_name(&design.type_name, id, from_version);
        if let Err(e) = self.backup.write(&name, payload.as_bytes()) {
            warn!(backup = %name, error = %e, "Failed to write document backup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupError, MemoryBackupWriter, NullBackupWriter};
    use crate::matcher::{RowMatcher, RowMigrationCommand};
    use crate::migration::Migration;
    use crate::registry::DocumentDesign;
    use crate::serializer::JsonSerializer;
    use serde::Deserialize;
    use serde_json::json;

    struct FailingBackupWriter;

    impl BackupWriter for FailingBackupWriter {
        fn write(&self, _name: &str, _payload: &[u8]) -> Result<(), BackupError> {
            Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "file in use",
            )))
        }
    }

    fn append(step: i64) -> RowMigrationCommand {
        RowMigrationCommand::for_type("Entity").with_change(move |mut doc| {
            doc["steps"]
                .as_array_mut()
                .ok_or("missing steps")?
                .push(json!(step));
            Ok(doc)
        })
    }

    fn config() -> Arc<Configuration> {
        Arc::new(
            Configuration::builder()
                .document(DocumentDesign::new("Entity", "Entities"))
                .document(DocumentDesign::new("SpecialEntity", "Entities").extends("Entity"))
                .document(DocumentDesign::new("Other", "Others"))
                .migration(Migration::new(1).document(append(1)))
                .migration(
                    Migration::new(2)
                        .document(append(2))
                        .document(RowMigrationCommand::for_type("SpecialEntity").with_change(
                            |mut doc| {
                                doc["special"] = json!(true);
                                Ok(doc)
                            },
                        )),
                )
                .migration(
                    Migration::new(3)
                        .document(append(3).with_matcher(RowMatcher::id_prefix("keep"))),
                )
                .build()
                .unwrap(),
        )
    }

    fn migrator(backup: Arc<dyn BackupWriter>) -> DocumentMigrator {
        DocumentMigrator::new(config(), Arc::new(JsonSerializer), backup)
    }

    fn row(id: &str, discriminator: &str, version: i64) -> DocumentRow {
        DocumentRow {
            id: id.to_string(),
            discriminator: discriminator.to_string(),
            version,
            awaits_reprojection: false,
            document: r#"{"steps":[]}"#.to_string(),
            etag: "etag".to_string(),
        }
    }

    fn design<'a>(migrator: &'a DocumentMigrator, type_name: &str) -> &'a DocumentDesign {
        migrator.config().registry().design(type_name).unwrap()
    }

    #[test]
    fn test_applies_due_commands_in_order() {
        let migrator = migrator(Arc::new(NullBackupWriter));

        let migrated = migrator
            .migrate(design(&migrator, "Entity"), row("keep-1", "Entity", 0))
            .unwrap();

        assert_eq!(migrated.row.version, 3);
        assert_eq!(migrated.from_version, 0);
        assert_eq!(migrated.applied, 3);
        assert!(migrated.needs_write());
        assert_eq!(migrated.document, json!({"steps": [1, 2, 3]}));
    }

    #[test]
    fn test_starts_from_recorded_version() {
        let migrator = migrator(Arc::new(NullBackupWriter));

        let migrated = migrator
            .migrate(design(&migrator, "Entity"), row("keep-1", "Entity", 1))
            .unwrap();

        assert_eq!(migrated.document, json!({"steps": [2, 3]}));
        assert_eq!(migrated.row.version, 3);
    }

    #[test]
    fn test_type_filter_and_matchers_select_commands() {
        let migrator = migrator(Arc::new(NullBackupWriter));

        let special = migrator
            .migrate(design(&migrator, "SpecialEntity"), row("other-1", "SpecialEntity", 0))
            .unwrap();
        assert_eq!(special.document, json!({"steps": [1, 2], "special": true}));

        let other = migrator
            .migrate(design(&migrator, "Other"), row("keep-2", "Other", 0))
            .unwrap();
        assert_eq!(other.applied, 0);
        assert_eq!(other.row.version, 3);
        assert_eq!(other.document, json!({"steps": []}));
    }

    #[test]
    fn test_current_row_is_a_noop() {
        let migrator = migrator(Arc::new(NullBackupWriter));

        let migrated = migrator
            .migrate(design(&migrator, "Entity"), row("keep-1", "Entity", 3))
            .unwrap();

        assert_eq!(migrated.applied, 0);
        assert!(!migrated.needs_write());
    }

    #[test]
    fn test_document_ahead_fails_fast() {
        let backups = Arc::new(MemoryBackupWriter::new());
        let migrator = migrator(backups.clone());

        match migrator.migrate(design(&migrator, "Entity"), row("e1", "Entity", 4)) {
            Err(MigrationError::DocumentAhead {
                version,
                configured,
                ..
            }) => {
                assert_eq!(version, 4);
                assert_eq!(configured, 3);
            }
            other => panic!("Expected DocumentAhead, got {:?}", other),
        }
        assert!(backups.entries().is_empty());
    }

    #[test]
    fn test_backup_written_once_before_first_change() {
        let backups = Arc::new(MemoryBackupWriter::new());
        let migrator = migrator(backups.clone());

        migrator
            .migrate(design(&migrator, "Entity"), row("keep-1", "Entity", 0))
            .unwrap();

        let entries = backups.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "Entity_keep-1_0.bak");
        assert_eq!(entries[0].1, br#"{"steps":[]}"#);
    }

    #[test]
    fn test_backup_failure_is_not_fatal() {
        let migrator = migrator(Arc::new(FailingBackupWriter));

        let migrated = migrator
            .migrate(design(&migrator, "Entity"), row("keep-1", "Entity", 0))
            .unwrap();
        assert_eq!(migrated.applied, 3);
    }

    #[test]
    fn test_change_failure_reports_migration_version() {
        let migrator = migrator(Arc::new(NullBackupWriter));
        let mut broken = row("keep-1", "Entity", 0);
        broken.document = "{}".to_string();

        match migrator.migrate(design(&migrator, "Entity"), broken) {
            Err(MigrationError::DocumentChange { version, reason, .. }) => {
                assert_eq!(version, 1);
                assert_eq!(reason, "missing steps");
            }
            other => panic!("Expected DocumentChange, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_and_migrate() {
        #[derive(Debug, Deserialize)]
        struct Entity {
            steps: Vec<i64>,
        }

        let migrator = migrator(Arc::new(NullBackupWriter));
        let (entity, migrated) = migrator
            .deserialize_and_migrate::<Entity>(design(&migrator, "Entity"), row("x", "Entity", 0))
            .unwrap();

        assert_eq!(entity.steps, vec![1, 2]);
        assert_eq!(migrated.row.version, 3);
    }
}
