//! Background document sweep.
//!
//! Migrates rows flagged by the schema pass in bounded batches. Each row is
//! written back with its original etag, so a concurrent writer always wins;
//! the sweep skips the row and moves on. Transient faults retry the batch
//! after a fixed backoff. Any other failure ends the pass for that table
//! only; it is retried on the next sweep.

use crate::config::{SweepConfig, SweepMode};
use crate::error::MigrationError;
use crate::matcher::RowMigrationCommand;
use crate::migrator::DocumentMigrator;
use crate::registry::Resolution;
use crate::row::{DocumentRow, Row};
use crate::schema::columns;
use crate::sql::SqlValue;
use crate::store::{Store, StoreError, Window};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of migrating one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// The row was migrated and saved.
    Migrated,
    /// Another writer changed the row first.
    SkippedConcurrentUpdate,
    /// A transient fault; the batch should be retried.
    RetryableFault(String),
    /// An unrecoverable failure; the table pass stops.
    FatalForTable(String),
}

impl RowOutcome {
    fn from_store_error(e: StoreError) -> Self {
        if e.is_concurrency_conflict() {
            RowOutcome::SkippedConcurrentUpdate
        } else if e.is_transient() {
            RowOutcome::RetryableFault(e.to_string())
        } else {
            RowOutcome::FatalForTable(e.to_string())
        }
    }

    fn from_migration_error(e: MigrationError) -> Self {
        match e {
            MigrationError::Store(store) => Self::from_store_error(store),
            other => RowOutcome::FatalForTable(other.to_string()),
        }
    }
}

/// Cooperative cancellation shared between a sweep and its owner.
#[derive(Debug, Default)]
pub struct CancellationSignal {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake any waiter.
    pub fn cancel(&self) {
        let _guard = self.lock.lock();
        self.cancelled.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless cancelled first. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.is_cancelled() {
            return true;
        }
        self.condvar.wait_for(&mut guard, timeout);
        self.is_cancelled()
    }
}

/// Outcome of sweeping one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSweepReport {
    /// Table name.
    pub table: String,
    /// Rows migrated.
    pub migrated: usize,
    /// Rows skipped because of concurrent updates.
    pub conflicts: usize,
    /// Batch retries after transient faults.
    pub retries: usize,
    /// Batches queried.
    pub batches: usize,
    /// Why the table pass was aborted, if it was.
    pub failure: Option<String>,
}

/// Outcome of one sweep over all document tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Per-table results, in configuration order.
    pub tables: Vec<TableSweepReport>,
    /// Whether the sweep was cancelled.
    pub cancelled: bool,
}

impl SweepReport {
    /// Total rows migrated.
    pub fn migrated(&self) -> usize {
        self.tables.iter().map(|t| t.migrated).sum()
    }

    /// Whether any table pass was aborted.
    pub fn has_failures(&self) -> bool {
        self.tables.iter().any(|t| t.failure.is_some())
    }

    /// Get the report of a table.
    pub fn table(&self, name: &str) -> Option<&TableSweepReport> {
        self.tables.iter().find(|t| t.table.eq_ignore_ascii_case(name))
    }
}

/// Migrates flagged rows in the background.
pub struct BackgroundSweepRunner<S> {
    store: Arc<S>,
    migrator: Arc<DocumentMigrator>,
    settings: SweepConfig,
    signal: Arc<CancellationSignal>,
}

impl<S: Store + 'static> BackgroundSweepRunner<S> {
    /// Create a sweep runner.
    pub fn new(store: Arc<S>, migrator: Arc<DocumentMigrator>, settings: SweepConfig) -> Self {
        Self {
            store,
            migrator,
            settings,
            signal: Arc::new(CancellationSignal::new()),
        }
    }

    /// The cancellation signal observed by this runner.
    pub fn signal(&self) -> Arc<CancellationSignal> {
        Arc::clone(&self.signal)
    }

    /// Sweep every document table once.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for table in self.migrator.config().document_tables() {
            if self.signal.is_cancelled() {
                break;
            }
            report.tables.push(self.sweep_table(&table.name));
        }
        report.cancelled = self.signal.is_cancelled();
        report
    }

    /// Migrate the flagged rows of one table until none remain, the pass
    /// fails, or the sweep is cancelled.
    pub fn sweep_table(&self, table: &str) -> TableSweepReport {
        let mut report = TableSweepReport {
            table: table.to_string(),
            ..Default::default()
        };
        let config = self.migrator.config();
        let predicate = RowMigrationCommand::awaiting_reprojection().to_sql(
            config.configured_version(),
            config.registry(),
            table,
        );
        let batch_size = self.settings.batch_size.max(1);
        let mut backlog = 0usize;
        let mut retrying = false;
        let mut skip = 0usize;

        loop {
            if self.signal.is_cancelled() {
                break;
            }

            if !retrying {
                skip = if backlog > batch_size {
                    rand::thread_rng().gen_range(0..=backlog - batch_size)
                } else {
                    0
                };
            }
            retrying = false;

            let page = match self.store.query(table, &predicate, Window::new(skip, batch_size)) {
                Ok(page) => page,
                Err(e) if e.is_transient() => {
                    if !self.backoff(&mut report, &e.to_string()) {
                        break;
                    }
                    retrying = true;
                    continue;
                }
                Err(e) => {
                    error!(table = %table, error = %e, "Sweep query failed");
                    report.failure = Some(e.to_string());
                    break;
                }
            };
            report.batches += 1;
            debug!(table = %table, skip, rows = page.rows.len(), total = page.total, "Sweep batch");

            if page.rows.is_empty() {
                if page.total == 0 || skip == 0 {
                    break;
                }
                // The backlog shrank below the skip offset.
                backlog = page.total;
                continue;
            }
            backlog = page.total;

            let mut progressed = false;
            for row in &page.rows {
                if self.signal.is_cancelled() {
                    break;
                }

                match self.migrate_row(table, row) {
                    RowOutcome::Migrated => {
                        report.migrated += 1;
                        progressed = true;
                    }
                    RowOutcome::SkippedConcurrentUpdate => {
                        warn!(table = %table, id = ?row.text(columns::ID), "Row changed concurrently, skipping");
                        report.conflicts += 1;
                    }
                    RowOutcome::RetryableFault(reason) => {
                        retrying = true;
                        if !self.backoff(&mut report, &reason) {
                            return report;
                        }
                        break;
                    }
                    RowOutcome::FatalForTable(reason) => {
                        error!(
                            table = %table,
                            id = ?row.text(columns::ID),
                            error = %reason,
                            "Unrecoverable row failure, aborting table"
                        );
                        report.failure = Some(reason);
                        return report;
                    }
                }
            }

            if !retrying && !progressed {
                // Every row was taken by other writers; leave the rest for the next sweep.
                break;
            }
        }

        if report.migrated > 0 || report.conflicts > 0 {
            info!(
                table = %table,
                migrated = report.migrated,
                conflicts = report.conflicts,
                retries = report.retries,
                "Table sweep finished"
            );
        }
        report
    }

    /// Run according to the configured mode until done or cancelled.
    ///
    /// Returns the report of the last sweep.
    pub fn run(&self) -> SweepReport {
        loop {
            let report = self.sweep();
            if report.cancelled || self.settings.mode == SweepMode::Once {
                return report;
            }
            if self.signal.wait_timeout(self.settings.poll_interval()) {
                return SweepReport {
                    cancelled: true,
                    ..report
                };
            }
        }
    }

    /// Run on a background thread.
    pub fn start(self) -> SweepHandle {
        let signal = self.signal();
        let handle = thread::spawn(move || self.run());

        SweepHandle {
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn migrate_row(&self, table: &str, row: &Row) -> RowOutcome {
        let document_row = match DocumentRow::from_row(table, row) {
            Ok(r) => r,
            Err(e) => return RowOutcome::from_migration_error(e),
        };

        let config = self.migrator.config();
        let design = match config.registry().resolve(table, &document_row.discriminator) {
            Resolution::Found(design) => design,
            Resolution::NotFound => {
                return RowOutcome::from_migration_error(MigrationError::DiscriminatorNotFound {
                    table: table.to_string(),
                    discriminator: document_row.discriminator,
                })
            }
        };

        let etag = document_row.etag.clone();
        let migrated = match self.migrator.migrate(design, document_row) {
            Ok(m) => m,
            Err(e) => return RowOutcome::from_migration_error(e),
        };

        let mut values = design.project(&migrated.document);
        values.push((
            columns::DOCUMENT.to_string(),
            SqlValue::from(migrated.row.document.as_str()),
        ));
        values.push((columns::VERSION.to_string(), SqlValue::Integer(migrated.row.version)));
        values.push((columns::AWAITS_REPROJECTION.to_string(), SqlValue::Bool(false)));
        values.push((columns::MODIFIED_AT.to_string(), SqlValue::from(Utc::now().to_rfc3339())));

        match self.store.update(table, &migrated.row.id, &etag, &values) {
            Ok(_) => RowOutcome::Migrated,
            Err(e) => RowOutcome::from_store_error(e),
        }
    }

    /// Wait out the retry backoff. Returns false if cancelled meanwhile.
    fn backoff(&self, report: &mut TableSweepReport, reason: &str) -> bool {
        warn!(
            table = %report.table,
            error = %reason,
            backoff_ms = self.settings.retry_backoff_ms,
            "Transient fault during sweep, retrying batch"
        );
        report.retries += 1;
        !self.signal.wait_timeout(self.settings.retry_backoff())
    }
}

/// Handle to a sweep running on a background thread.
pub struct SweepHandle {
    signal: Arc<CancellationSignal>,
    handle: Mutex<Option<JoinHandle<SweepReport>>>,
}

impl SweepHandle {
    /// Request cancellation and wait for the thread to finish.
    pub fn stop(&self) -> Option<SweepReport> {
        self.signal.cancel();
        self.join()
    }

    /// Wait for the sweep to finish on its own.
    pub fn wait(&self) -> Option<SweepReport> {
        self.join()
    }

    /// Check if the sweep is still running.
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn join(&self) -> Option<SweepReport> {
        let handle = self.handle.lock().take()?;
        match handle.join() {
            Ok(report) => Some(report),
            Err(_) => {
                error!("Sweep thread panicked");
                None
            }
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
