//! Document store facade.
//!
//! Loading a document migrates it inline, so callers never see an outdated
//! shape. The migrated form is written back on the next save rather than on
//! every read.

use crate::backup::{BackupWriter, NullBackupWriter};
use crate::config::{Configuration, MigrationConfig, SweepConfig};
use crate::error::MigrationError;
use crate::migrator::DocumentMigrator;
use crate::registry::{DocumentDesign, Resolution};
use crate::row::{DocumentRow, Row};
use crate::runner::{MigrationRunner, RunReport};
use crate::schema::columns;
use crate::serializer::{self, JsonSerializer};
use crate::sql::{quote_ident, SqlFragment, SqlValue};
use crate::store::{Store, StoreError, Window};
use crate::sweep::{BackgroundSweepRunner, SweepHandle};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// A loaded document.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    /// The document, at the configured version.
    pub document: T,
    /// Concrete type of the stored row.
    pub type_name: String,
    /// Concurrency token to pass to [`DocumentStore::save`].
    pub etag: String,
    /// Version the row is stored at.
    pub stored_version: i64,
    /// Whether the document was migrated while loading.
    pub migrated: bool,
}

/// Reads and writes documents, migrating them on load.
pub struct DocumentStore<S> {
    store: Arc<S>,
    migrator: Arc<DocumentMigrator>,
}

impl<S: Store + 'static> DocumentStore<S> {
    /// Create a store with JSON serialization and no backups.
    pub fn new(store: Arc<S>, config: Arc<Configuration>) -> Self {
        Self::with_backup(store, config, Arc::new(NullBackupWriter))
    }

    /// Create a store that backs documents up before migrating them.
    pub fn with_backup(
        store: Arc<S>,
        config: Arc<Configuration>,
        backup: Arc<dyn BackupWriter>,
    ) -> Self {
        let migrator = DocumentMigrator::new(config, Arc::new(JsonSerializer), backup);
        Self {
            store,
            migrator: Arc::new(migrator),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The document migrator.
    pub fn migrator(&self) -> &Arc<DocumentMigrator> {
        &self.migrator
    }

    /// Run the schema pass, then start the background sweep.
    pub fn migrate(
        &self,
        migration: MigrationConfig,
        sweep: SweepConfig,
    ) -> Result<(RunReport, SweepHandle), MigrationError> {
        let report =
            MigrationRunner::new(self.migrator.shared_config(), migration).run(self.store.as_ref())?;

        let handle = BackgroundSweepRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.migrator),
            sweep,
        )
        .start();

        Ok((report, handle))
    }

    /// Insert a new document, returning its etag.
    pub fn insert<T: Serialize>(
        &self,
        type_name: &str,
        id: &str,
        document: &T,
    ) -> Result<String, MigrationError> {
        let design = self.design(type_name)?;
        let value = serializer::to_value(document)?;
        let now = Utc::now().to_rfc3339();

        let mut row = Row::new()
            .with(columns::ID, id)
            .with(columns::DISCRIMINATOR, design.discriminator.as_str())
            .with(columns::VERSION, self.migrator.config().configured_version())
            .with(columns::AWAITS_REPROJECTION, false)
            .with(columns::DOCUMENT, self.migrator.serializer().to_text(&value)?)
            .with(columns::CREATED_AT, now.as_str())
            .with(columns::MODIFIED_AT, now);
        for (column, projected) in design.project(&value) {
            row.insert(column, projected);
        }

        Ok(self.store.insert(&design.table, &row)?)
    }

    /// Load a document of `type_name` or one of its subtypes.
    pub fn load<T: DeserializeOwned>(
        &self,
        type_name: &str,
        id: &str,
    ) -> Result<Option<Loaded<T>>, MigrationError> {
        let (row, concrete) = match self.fetch(type_name, id)? {
            Some(found) => found,
            None => return Ok(None),
        };
        if !self.migrator.config().registry().is_assignable(&concrete.type_name, type_name) {
            return Ok(None);
        }

        let etag = row.etag.clone();
        let (document, migrated) = self.migrator.deserialize_and_migrate::<T>(concrete, row)?;
        if migrated.needs_write() {
            debug!(
                type_name = %concrete.type_name,
                id = %id,
                from_version = migrated.from_version,
                "Migrated document on load"
            );
        }

        Ok(Some(Loaded {
            document,
            type_name: concrete.type_name.clone(),
            etag,
            stored_version: migrated.from_version,
            migrated: migrated.needs_write(),
        }))
    }

    /// Save a document if `etag` is still current, returning the new etag.
    ///
    /// The row is written at the configured version with its projections
    /// recomputed and its migration flag cleared.
    pub fn save<T: Serialize>(
        &self,
        type_name: &str,
        id: &str,
        etag: &str,
        document: &T,
    ) -> Result<String, MigrationError> {
        let design = self.design(type_name)?;
        // The stored row keeps its concrete type; saving through a base type
        // must not re-tag a subtype.
        let concrete = match self.fetch(type_name, id)? {
            Some((_, concrete)) => concrete,
            None => {
                return Err(StoreError::ConcurrencyConflict {
                    table: design.table.clone(),
                    id: id.to_string(),
                }
                .into())
            }
        };
        if !self.migrator.config().registry().is_assignable(&concrete.type_name, type_name) {
            return Err(MigrationError::WrongType {
                id: id.to_string(),
                stored_type: concrete.type_name.clone(),
                requested_type: type_name.to_string(),
            });
        }
        let value = serializer::to_value(document)?;

        let mut values = concrete.project(&value);
        values.push((
            columns::DOCUMENT.to_string(),
            SqlValue::from(self.migrator.serializer().to_text(&value)?),
        ));
        values.push((
            columns::DISCRIMINATOR.to_string(),
            SqlValue::from(concrete.discriminator.as_str()),
        ));
        values.push((
            columns::VERSION.to_string(),
            SqlValue::Integer(self.migrator.config().configured_version()),
        ));
        values.push((columns::AWAITS_REPROJECTION.to_string(), SqlValue::Bool(false)));
        values.push((columns::MODIFIED_AT.to_string(), SqlValue::from(Utc::now().to_rfc3339())));

        Ok(self.store.update(&design.table, id, etag, &values)?)
    }

    /// Delete a document if `etag` is still current.
    pub fn delete(&self, type_name: &str, id: &str, etag: &str) -> Result<(), MigrationError> {
        let design = self.design(type_name)?;
        Ok(self.store.delete(&design.table, id, etag)?)
    }

    /// Read the row stored under `id` in the table of `type_name`, along
    /// with the design its discriminator resolves to.
    fn fetch(
        &self,
        type_name: &str,
        id: &str,
    ) -> Result<Option<(DocumentRow, &DocumentDesign)>, MigrationError> {
        let design = self.design(type_name)?;
        let page = self.store.query(
            &design.table,
            &SqlFragment::new(format!("{} = ?", quote_ident(columns::ID)), vec![id.into()]),
            Window::new(0, 1),
        )?;
        let row = match page.rows.first() {
            Some(row) => DocumentRow::from_row(&design.table, row)?,
            None => return Ok(None),
        };

        match self.migrator.config().registry().resolve(&design.table, &row.discriminator) {
            Resolution::Found(concrete) => Ok(Some((row, concrete))),
            Resolution::NotFound => Err(MigrationError::DiscriminatorNotFound {
                table: design.table.clone(),
                discriminator: row.discriminator,
            }),
        }
    }

    fn design(&self, type_name: &str) -> Result<&DocumentDesign, MigrationError> {
        self.migrator
            .config()
            .registry()
            .design(type_name)
            .ok_or_else(|| MigrationError::UnknownType(type_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::RowMigrationCommand;
    use crate::migration::Migration;
    use crate::registry::Projection;
    use crate::schema::{Column, ColumnType};
    use crate::store::SqliteStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entity {
        name: String,
        #[serde(default)]
        tags: Vec<String>,
    }

    fn config(with_migration: bool) -> Arc<Configuration> {
        let mut builder = Configuration::builder()
            .document(
                DocumentDesign::new("Entity", "Entities").with_projection(Projection::pointer(
                    Column::new("Name", ColumnType::Text),
                    "/name",
                )),
            )
            .document(DocumentDesign::new("SpecialEntity", "Entities").extends("Entity"))
            .document(DocumentDesign::new("Other", "Others"));
        if with_migration {
            builder = builder.migration(Migration::new(1).document(
                RowMigrationCommand::for_type("Entity").with_change(|mut doc| {
                    doc["tags"] = json!(["migrated"]);
                    Ok(doc)
                }),
            ));
        }
        Arc::new(builder.build().unwrap())
    }

    fn migrated_store(config: Arc<Configuration>, store: Arc<SqliteStore>) -> DocumentStore<SqliteStore> {
        MigrationRunner::new(Arc::clone(&config), MigrationConfig::default())
            .run(store.as_ref())
            .unwrap();
        DocumentStore::new(store, config)
    }

    fn entity(name: &str) -> Entity {
        Entity {
            name: name.to_string(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_insert_load_save_delete() {
        let docs = migrated_store(config(false), Arc::new(SqliteStore::open_in_memory().unwrap()));

        let etag = docs.insert("Entity", "e1", &entity("first")).unwrap();
        let loaded: Loaded<Entity> = docs.load("Entity", "e1").unwrap().unwrap();
        assert_eq!(loaded.document, entity("first"));
        assert_eq!(loaded.etag, etag);
        assert!(!loaded.migrated);

        let new_etag = docs.save("Entity", "e1", &etag, &entity("second")).unwrap();
        match docs.save("Entity", "e1", &etag, &entity("stale")) {
            Err(MigrationError::Store(e)) => assert!(e.is_concurrency_conflict()),
            other => panic!("Expected concurrency conflict, got {:?}", other),
        }

        let page = docs
            .store()
            .query("Entities", &SqlFragment::always(), Window::new(0, 10))
            .unwrap();
        assert_eq!(page.rows[0].text("Name"), Some("second"));

        docs.delete("Entity", "e1", &new_etag).unwrap();
        assert!(docs.load::<Entity>("Entity", "e1").unwrap().is_none());
    }

    #[test]
    fn test_load_respects_hierarchy() {
        let docs = migrated_store(config(false), Arc::new(SqliteStore::open_in_memory().unwrap()));
        docs.insert("SpecialEntity", "s1", &entity("special")).unwrap();

        let loaded = docs.load::<Entity>("Entity", "s1").unwrap().unwrap();
        assert_eq!(loaded.type_name, "SpecialEntity");
        assert!(docs.load::<Entity>("Other", "s1").unwrap().is_none());

        docs.insert("Entity", "e1", &entity("plain")).unwrap();
        assert!(docs.load::<Entity>("SpecialEntity", "e1").unwrap().is_none());
    }

    #[test]
    fn test_subtype_rows_get_inherited_projections() {
        let docs = migrated_store(config(false), Arc::new(SqliteStore::open_in_memory().unwrap()));
        docs.insert("SpecialEntity", "s1", &entity("special")).unwrap();

        let page = docs
            .store()
            .query("Entities", &SqlFragment::always(), Window::new(0, 10))
            .unwrap();
        assert_eq!(page.rows[0].text("Name"), Some("special"));
    }

    #[test]
    fn test_save_through_base_type_keeps_subtype() {
        let docs = migrated_store(config(false), Arc::new(SqliteStore::open_in_memory().unwrap()));
        docs.insert("SpecialEntity", "s1", &entity("special")).unwrap();

        let loaded = docs.load::<Entity>("Entity", "s1").unwrap().unwrap();
        assert_eq!(loaded.type_name, "SpecialEntity");
        docs.save("Entity", "s1", &loaded.etag, &entity("renamed")).unwrap();

        let page = docs
            .store()
            .query("Entities", &SqlFragment::always(), Window::new(0, 10))
            .unwrap();
        assert_eq!(page.rows[0].text(columns::DISCRIMINATOR), Some("SpecialEntity"));
        assert_eq!(page.rows[0].text("Name"), Some("renamed"));

        let special = docs.load::<Entity>("SpecialEntity", "s1").unwrap().unwrap();
        assert_eq!(special.type_name, "SpecialEntity");
        assert_eq!(special.document, entity("renamed"));
    }

    #[test]
    fn test_save_rejects_unrelated_type() {
        let docs = migrated_store(config(false), Arc::new(SqliteStore::open_in_memory().unwrap()));
        let etag = docs.insert("Entity", "e1", &entity("plain")).unwrap();

        match docs.save("SpecialEntity", "e1", &etag, &entity("special")) {
            Err(MigrationError::WrongType {
                stored_type,
                requested_type,
                ..
            }) => {
                assert_eq!(stored_type, "Entity");
                assert_eq!(requested_type, "SpecialEntity");
            }
            other => panic!("Expected WrongType, got {:?}", other),
        }

        match docs.save("Entity", "missing", &etag, &entity("x")) {
            Err(MigrationError::Store(e)) => assert!(e.is_concurrency_conflict()),
            other => panic!("Expected concurrency conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_load_migrates_inline_without_writing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let old = migrated_store(config(false), Arc::clone(&store));
        let etag = old.insert("Entity", "e1", &entity("legacy")).unwrap();

        let docs = migrated_store(config(true), Arc::clone(&store));
        let loaded = docs.load::<Entity>("Entity", "e1").unwrap().unwrap();
        assert!(loaded.migrated);
        assert_eq!(loaded.stored_version, 0);
        assert_eq!(loaded.document.tags, vec!["migrated".to_string()]);
        assert_eq!(loaded.etag, etag);

        // Still stored at the old version until saved.
        let again = docs.load::<Entity>("Entity", "e1").unwrap().unwrap();
        assert!(again.migrated);

        docs.save("Entity", "e1", &loaded.etag, &loaded.document).unwrap();
        let saved = docs.load::<Entity>("Entity", "e1").unwrap().unwrap();
        assert!(!saved.migrated);
        assert_eq!(saved.stored_version, 1);
    }

    #[test]
    fn test_unknown_type() {
        let docs = migrated_store(config(false), Arc::new(SqliteStore::open_in_memory().unwrap()));
        match docs.insert("Ghost", "g1", &entity("x")) {
            Err(MigrationError::UnknownType(name)) => assert_eq!(name, "Ghost"),
            other => panic!("Expected UnknownType, got {:?}", other),
        }
    }
}
