//! Docshift Core - schema reconciliation and document migration.
//!
//! This crate keeps a relational document store in step with the document
//! model of the running code:
//! - Schema diffing into safe and unsafe DDL commands
//! - Versioned scripted migrations under a database-wide lock
//! - Row matching in SQL and in memory
//! - Per-document migration with backups
//! - A background sweep that migrates flagged rows in bounded batches
//!
//! # Example
//!
//! ```ignore
//! use docshift_core::{Configuration, DocumentDesign, DocumentStore, Migration, SqliteStore};
//!
//! let config = Configuration::builder()
//!     .document(DocumentDesign::new("Entity", "Entities"))
//!     .migration(Migration::new(1).document(
//!         RowMigrationCommand::for_type("Entity").with_change(|mut doc| {
//!             doc["tags"] = serde_json::json!([]);
//!             Ok(doc)
//!         }),
//!     ))
//!     .build()?;
//!
//! let docs = DocumentStore::new(Arc::new(SqliteStore::open("app.db")?), Arc::new(config));
//! let (report, sweep) = docs.migrate(MigrationConfig::default(), SweepConfig::default())?;
//! ```

pub mod backup;
pub mod config;
pub mod ddl;
pub mod diff;
pub mod error;
pub mod matcher;
pub mod migration;
pub mod migrator;
pub mod registry;
pub mod row;
pub mod runner;
pub mod schema;
pub mod serializer;
pub mod session;
pub mod sql;
pub mod store;
pub mod sweep;

pub use backup::{
    BackupEntry, BackupError, BackupWriter, FileBackupWriter, GzipBackupWriter,
    MemoryBackupWriter, NullBackupWriter, SledBackupWriter,
};
pub use config::{
    Configuration, ConfigurationBuilder, MigrationConfig, SweepConfig, SweepMode, TableMode,
};
pub use ddl::{DdlCommand, DdlKind};
pub use diff::SchemaDiffer;
pub use error::{ConfigError, MigrationError, RunStep};
pub use matcher::{RowMatcher, RowMigrationCommand};
pub use migration::Migration;
pub use migrator::{DocumentMigrator, MigratedRow};
pub use registry::{DocumentDesign, DocumentRegistry, Projection, Resolution};
pub use row::{DocumentRow, Row};
pub use runner::{MigrationRunner, RunContext, RunReport, METADATA_TABLE};
pub use schema::{columns, ActualSchema, Column, ColumnType, Table, TableKind};
pub use serializer::{JsonSerializer, Serializer};
pub use session::{DocumentStore, Loaded};
pub use sql::{SqlFragment, SqlValue};
pub use store::{Page, SqliteStore, Store, StoreError, StoreTransaction, Window};
pub use sweep::{
    BackgroundSweepRunner, CancellationSignal, RowOutcome, SweepHandle, SweepReport,
    TableSweepReport,
};
