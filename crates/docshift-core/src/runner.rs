//! Schema migration pass.
//!
//! One pass takes the database-wide lock, brings the schema up to the
//! configuration, flags rows that need document migration or reprojection,
//! and records the new schema version. Everything happens in a single
//! exclusive transaction: a failure at any step leaves the database as it
//! was.
//!
//! With no migrations registered a completed pass records version 0, so a
//! stored -1 only ever means no pass has completed yet.

use crate::config::{Configuration, MigrationConfig, TableMode};
use crate::ddl::DdlCommand;
use crate::diff::SchemaDiffer;
use crate::error::{MigrationError, RunStep};
use crate::matcher::RowMigrationCommand;
use crate::schema::{columns, ActualSchema};
use crate::sql::{quote_ident, SqlFragment, SqlValue};
use crate::store::{Store, StoreError, StoreTransaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Table holding the persisted schema version.
pub const METADATA_TABLE: &str = "DocshiftMetadata";

/// Column of [`METADATA_TABLE`] holding the version.
pub const VERSION_COLUMN: &str = "SchemaVersion";

/// Schema version of a database no pass has completed on.
pub const FRESH_VERSION: i64 = -1;

/// Outcome of a schema pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Version found before the pass.
    pub from_version: i64,
    /// Version persisted by the pass.
    pub to_version: i64,
    /// Versions of the migrations that were due.
    pub due_versions: Vec<i64>,
    /// Descriptions of executed commands, in execution order.
    pub executed: Vec<String>,
    /// Unsafe diff commands that were not executed.
    pub skipped_unsafe: Vec<String>,
    /// Rows newly flagged for migration, per document table.
    pub flagged: BTreeMap<String, usize>,
}

impl RunReport {
    /// Whether the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.executed.is_empty()
            && self.from_version == self.to_version
            && self.flagged.values().all(|&n| n == 0)
    }
}

/// State of one pass, threaded through every step.
#[derive(Debug)]
pub struct RunContext {
    /// Version read from the metadata table.
    pub persisted_version: i64,
    /// Highest registered migration version.
    pub configured_version: i64,
    /// Table mode of the pass.
    pub table_mode: TableMode,
    executed: Vec<DdlCommand>,
    skipped: Vec<DdlCommand>,
    before_executed: usize,
}

impl RunContext {
    fn new(configured_version: i64, table_mode: TableMode) -> Self {
        Self {
            persisted_version: FRESH_VERSION,
            configured_version,
            table_mode,
            executed: Vec::new(),
            skipped: Vec::new(),
            before_executed: 0,
        }
    }

    /// Whether no pass has completed on the database.
    pub fn is_fresh(&self) -> bool {
        self.persisted_version == FRESH_VERSION
    }

    /// Commands executed so far.
    pub fn executed(&self) -> &[DdlCommand] {
        &self.executed
    }

    /// Tables whose rows need reprojection because of executed commands.
    pub fn reprojection_targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self
            .executed
            .iter()
            .filter_map(|c| c.reprojection_target.as_deref())
            .collect();
        targets.sort_by_key(|t| t.to_ascii_lowercase());
        targets.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        targets
    }
}

/// Runs the schema pass.
pub struct MigrationRunner {
    config: Arc<Configuration>,
    settings: MigrationConfig,
}

impl MigrationRunner {
    /// Create a runner.
    pub fn new(config: Arc<Configuration>, settings: MigrationConfig) -> Self {
        Self { config, settings }
    }

    /// Run one pass against `store`.
    pub fn run<S: Store>(&self, store: &S) -> Result<RunReport, MigrationError> {
        let mut tx = store
            .begin_exclusive(self.settings.lock_timeout())
            .map_err(|e| match e {
                StoreError::LockTimeout { waited_ms } => MigrationError::LockTimeout { waited_ms },
                other => MigrationError::SchemaTransaction {
                    step: RunStep::AcquireLock,
                    source: other,
                },
            })?;

        let mut ctx = RunContext::new(self.config.configured_version(), self.settings.table_mode);
        match self.run_steps(&mut tx, &mut ctx) {
            Ok(report) => {
                tx.commit().map_err(at(RunStep::Commit))?;
                info!(
                    from_version = report.from_version,
                    to_version = report.to_version,
                    executed = report.executed.len(),
                    skipped_unsafe = report.skipped_unsafe.len(),
                    "Schema migration committed"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Schema migration failed, rolling back");
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn run_steps<T: StoreTransaction>(
        &self,
        tx: &mut T,
        ctx: &mut RunContext,
    ) -> Result<RunReport, MigrationError> {
        self.ensure_metadata_table(tx, ctx)
            .map_err(at(RunStep::EnsureMetadataTable))?;
        ctx.persisted_version = read_version(tx).map_err(at(RunStep::ReadVersion))?;

        if ctx.persisted_version > ctx.configured_version {
            return Err(MigrationError::SchemaAhead {
                persisted: ctx.persisted_version,
                configured: ctx.configured_version,
            });
        }

        let due: Vec<i64> = self
            .config
            .migrations_after(ctx.persisted_version)
            .map(|m| m.version)
            .collect();
        info!(
            persisted_version = ctx.persisted_version,
            configured_version = ctx.configured_version,
            due = due.len(),
            "Starting schema migration"
        );

        self.run_scripted(tx, ctx, true)
            .map_err(at(RunStep::RunBeforeDiffScripted))?;
        self.run_auto_diff(tx, ctx).map_err(at(RunStep::RunAutoDiff))?;
        self.run_scripted(tx, ctx, false)
            .map_err(at(RunStep::RunAfterDiffScripted))?;

        let flagged = self.flag_rows(tx, ctx).map_err(at(RunStep::FlagRows))?;

        let to_version = ctx.configured_version;
        if to_version != ctx.persisted_version {
            tx.execute(
                &format!(
                    "UPDATE {} SET {} = ?",
                    quote_ident(METADATA_TABLE),
                    quote_ident(VERSION_COLUMN)
                ),
                &[SqlValue::Integer(to_version)],
            )
            .map_err(at(RunStep::PersistNewVersion))?;
        }

        Ok(RunReport {
            from_version: ctx.persisted_version,
            to_version,
            due_versions: due,
            executed: ctx.executed.iter().map(|c| c.to_string()).collect(),
            skipped_unsafe: ctx.skipped.iter().map(|c| c.to_string()).collect(),
            flagged,
        })
    }

    fn ensure_metadata_table<T: StoreTransaction>(
        &self,
        tx: &mut T,
        ctx: &RunContext,
    ) -> Result<(), StoreError> {
        let temp = match ctx.table_mode {
            TableMode::RealTables => "",
            TableMode::TempTables => "TEMP ",
        };
        let table = quote_ident(METADATA_TABLE);
        let column = quote_ident(VERSION_COLUMN);

        tx.execute_batch(&format!(
            "CREATE {temp}TABLE IF NOT EXISTS {table} ({column} INTEGER NOT NULL); \
             INSERT INTO {table} ({column}) SELECT {fresh} \
             WHERE NOT EXISTS (SELECT 1 FROM {table});",
            temp = temp,
            table = table,
            column = column,
            fresh = FRESH_VERSION
        ))
    }

    fn run_scripted<T: StoreTransaction>(
        &self,
        tx: &mut T,
        ctx: &mut RunContext,
        before: bool,
    ) -> Result<(), StoreError> {
        let due = self.config.migrations_after(ctx.persisted_version);
        if ctx.table_mode == TableMode::TempTables {
            debug!("Skipping scripted migrations for temporary tables");
            return Ok(());
        }

        for migration in due {
            let commands = if before {
                &migration.before_auto
            } else {
                &migration.after_auto
            };
            for command in commands {
                tx.execute_batch(&command.to_sql(ctx.table_mode))?;
                info!(version = migration.version, command = %command, "Executed scripted command");
                ctx.executed.push(command.clone());
                if before {
                    ctx.before_executed += 1;
                }
            }
        }

        Ok(())
    }

    fn run_auto_diff<T: StoreTransaction>(
        &self,
        tx: &mut T,
        ctx: &mut RunContext,
    ) -> Result<(), StoreError> {
        let actual = if ctx.is_fresh() && ctx.before_executed == 0 {
            ActualSchema::empty()
        } else {
            let mut actual = tx.actual_schema()?;
            actual.remove(METADATA_TABLE);
            actual
        };

        for command in SchemaDiffer::diff(&actual, self.config.tables()) {
            if !command.safe {
                warn!(command = %command, "Skipping unsafe schema change");
                ctx.skipped.push(command);
                continue;
            }

            tx.execute_batch(&command.to_sql(ctx.table_mode))?;
            info!(command = %command, "Executed schema change");
            ctx.executed.push(command);
        }

        Ok(())
    }

    fn flag_rows<T: StoreTransaction>(
        &self,
        tx: &mut T,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, usize>, StoreError> {
        let registry = self.config.registry();
        let targets = ctx.reprojection_targets();
        let mut flagged = BTreeMap::new();

        for table in self.config.document_tables() {
            let mut predicates = Vec::new();
            if targets.iter().any(|t| t.eq_ignore_ascii_case(&table.name)) {
                predicates.push(RowMigrationCommand::reproject().to_sql(0, registry, &table.name));
            }
            for migration in self.config.migrations() {
                for command in &migration.document_commands {
                    if command.applies_to_table(registry, &table.name) {
                        predicates.push(command.to_sql(migration.version, registry, &table.name));
                    }
                }
            }
            if predicates.is_empty() {
                continue;
            }

            let flag = quote_ident(columns::AWAITS_REPROJECTION);
            let predicate = SqlFragment::or_any(predicates);
            let changed = tx.execute(
                &format!(
                    "UPDATE {} SET {flag} = 1 WHERE {flag} = 0 AND ({})",
                    quote_ident(&table.name),
                    predicate.sql,
                    flag = flag
                ),
                &predicate.params,
            )?;

            if changed > 0 {
                info!(table = %table.name, rows = changed, "Flagged rows for migration");
            }
            flagged.insert(table.name.clone(), changed);
        }

        Ok(flagged)
    }
}

fn read_version<T: StoreTransaction>(tx: &mut T) -> Result<i64, StoreError> {
    let rows = tx.query(
        &format!(
            "SELECT {} FROM {} LIMIT 1",
            quote_ident(VERSION_COLUMN),
            quote_ident(METADATA_TABLE)
        ),
        &[],
    )?;

    rows.first()
        .and_then(|r| r.integer(VERSION_COLUMN))
        .ok_or_else(|| StoreError::InvalidData(format!("{} has no version row", METADATA_TABLE)))
}

fn at(step: RunStep) -> impl FnOnce(StoreError) -> MigrationError {
    move |source| MigrationError::SchemaTransaction { step, source }
}
