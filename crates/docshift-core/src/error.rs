//! Engine error types.

use crate::store::StoreError;
use thiserror::Error;

/// Errors raised while building a [`Configuration`](crate::config::Configuration).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Two tables share a name.
    #[error("table '{0}' is declared more than once")]
    DuplicateTable(String),

    /// Two document designs share a type name.
    #[error("document type '{0}' is declared more than once")]
    DuplicateType(String),

    /// Two designs in the same table share a discriminator.
    #[error("discriminator '{discriminator}' is used twice in table '{table}'")]
    DuplicateDiscriminator {
        /// Table holding both designs.
        table: String,
        /// The clashing discriminator.
        discriminator: String,
    },

    /// A design points at a table that is not a document table.
    #[error("table '{table}' of document type '{type_name}' is not a document table")]
    NotADocumentTable {
        /// The document type.
        type_name: String,
        /// The offending table.
        table: String,
    },

    /// A design names a parent type that was never declared.
    #[error("document type '{type_name}' extends unknown type '{parent}'")]
    UnknownParent {
        /// The document type.
        type_name: String,
        /// The missing parent.
        parent: String,
    },

    /// A document command filters on a type that was never declared.
    #[error("migration {version} filters on unknown document type '{type_name}'")]
    UnknownTypeFilter {
        /// Version of the migration carrying the command.
        version: i64,
        /// The missing type.
        type_name: String,
    },

    /// Migration versions must be positive.
    #[error("migration version must be greater than zero, got {0}")]
    InvalidVersion(i64),

    /// Two migrations share a version.
    #[error("migration version {0} is registered more than once")]
    DuplicateVersion(i64),
}

/// Step of the schema pass, used to report where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    /// Taking the database-wide migration lock.
    AcquireLock,
    /// Creating the schema version table.
    EnsureMetadataTable,
    /// Reading the persisted schema version.
    ReadVersion,
    /// Scripted commands that run before the automatic diff.
    RunBeforeDiffScripted,
    /// Commands computed by diffing.
    RunAutoDiff,
    /// Scripted commands that run after the automatic diff.
    RunAfterDiffScripted,
    /// Marking rows that need migration or reprojection.
    FlagRows,
    /// Writing the new schema version.
    PersistNewVersion,
    /// Committing the transaction.
    Commit,
}

impl std::fmt::Display for RunStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStep::AcquireLock => write!(f, "acquire_lock"),
            RunStep::EnsureMetadataTable => write!(f, "ensure_metadata_table"),
            RunStep::ReadVersion => write!(f, "read_version"),
            RunStep::RunBeforeDiffScripted => write!(f, "before_diff_scripted"),
            RunStep::RunAutoDiff => write!(f, "auto_diff"),
            RunStep::RunAfterDiffScripted => write!(f, "after_diff_scripted"),
            RunStep::FlagRows => write!(f, "flag_rows"),
            RunStep::PersistNewVersion => write!(f, "persist_new_version"),
            RunStep::Commit => write!(f, "commit"),
        }
    }
}

/// Migration engine errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The database was migrated by newer code than is running.
    #[error("database schema version {persisted} is ahead of configured version {configured}")]
    SchemaAhead {
        /// Version found in the metadata table.
        persisted: i64,
        /// Highest registered migration version.
        configured: i64,
    },

    /// A persisted document carries a version the running code does not know.
    #[error(
        "document {type_name}/{id} has version {version}, ahead of configured version {configured}"
    )]
    DocumentAhead {
        /// Document type.
        type_name: String,
        /// Document id.
        id: String,
        /// Version stored on the row.
        version: i64,
        /// Highest registered migration version.
        configured: i64,
    },

    /// The migration lock could not be taken in time.
    #[error("timed out after {waited_ms}ms waiting for the schema migration lock")]
    LockTimeout {
        /// How long the runner waited.
        waited_ms: u64,
    },

    /// Any failure inside the schema transaction. Nothing was committed.
    #[error("schema migration failed during {step}: {source}")]
    SchemaTransaction {
        /// Step that failed.
        step: RunStep,
        /// Underlying storage error.
        #[source]
        source: StoreError,
    },

    /// A row's discriminator does not resolve to any registered design.
    #[error("no document design for discriminator '{discriminator}' in table '{table}'")]
    DiscriminatorNotFound {
        /// Table the row lives in.
        table: String,
        /// Discriminator found on the row.
        discriminator: String,
    },

    /// A document type was requested that was never registered.
    #[error("unknown document type '{0}'")]
    UnknownType(String),

    /// A stored document is not of the requested type or one of its subtypes.
    #[error("document '{id}' is a {stored_type}, not a {requested_type}")]
    WrongType {
        /// Document id.
        id: String,
        /// Concrete type of the stored row.
        stored_type: String,
        /// Type the caller asked for.
        requested_type: String,
    },

    /// A document change command failed.
    #[error("document change for {type_name}/{id} in migration {version} failed: {reason}")]
    DocumentChange {
        /// Document type.
        type_name: String,
        /// Document id.
        id: String,
        /// Migration version the command belongs to.
        version: i64,
        /// Failure reported by the command.
        reason: String,
    },

    /// A stored row is missing columns or carries values of the wrong type.
    #[error("malformed row in table '{table}': {reason}")]
    MalformedRow {
        /// Table the row was read from.
        table: String,
        /// What was wrong.
        reason: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Whether the error means the running code is older than the data.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MigrationError::SchemaAhead { .. }
                | MigrationError::DocumentAhead { .. }
                | MigrationError::Config(_)
        )
    }
}
