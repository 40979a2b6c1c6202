//! Storage driver seam.
//!
//! The engine talks to the database only through [`Store`] and
//! [`StoreTransaction`]. [`SqliteStore`] implements both on a single
//! rusqlite connection; open one store per process (or per test "process")
//! to share a database file.

use crate::row::Row;
use crate::schema::{columns, ActualSchema};
use crate::sql::{quote_ident, SqlFragment, SqlValue};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Busy timeout for statements outside the migration lock.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The row was changed or removed by another writer.
    #[error("concurrency conflict on {table}/{id}")]
    ConcurrencyConflict {
        /// Table of the row.
        table: String,
        /// Row id.
        id: String,
    },

    /// The exclusive lock could not be taken in time.
    #[error("lock not acquired within {waited_ms}ms")]
    LockTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A fault expected to clear on retry.
    #[error("transient fault: {0}")]
    Transient(String),

    /// Invalid data handed to or read from the store.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }

    /// Whether the error is an optimistic concurrency conflict.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// A page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Rows to skip.
    pub skip: usize,
    /// Maximum rows to return.
    pub take: usize,
}

impl Window {
    /// Create a window.
    pub fn new(skip: usize, take: usize) -> Self {
        Self { skip, take }
    }
}

/// Rows returned by a query, with the total number of matching rows.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Rows in the window, ordered by id.
    pub rows: Vec<Row>,
    /// Number of rows matching the predicate.
    pub total: usize,
}

/// An exclusive transaction holding the database-wide migration lock.
///
/// Dropping an unfinished transaction rolls it back.
pub trait StoreTransaction {
    /// Execute one statement, returning the number of changed rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError>;

    /// Execute statements without parameters.
    fn execute_batch(&mut self, sql: &str) -> Result<(), StoreError>;

    /// Run a query.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError>;

    /// Read the current tables and their columns.
    fn actual_schema(&mut self) -> Result<ActualSchema, StoreError>;

    /// Commit.
    fn commit(self) -> Result<(), StoreError>;

    /// Roll back.
    fn rollback(self) -> Result<(), StoreError>;
}

/// Relational storage used by the migration engine.
pub trait Store: Send + Sync {
    /// Transaction type.
    type Transaction<'a>: StoreTransaction
    where
        Self: 'a;

    /// Start an exclusive transaction, waiting at most `timeout` for the lock.
    fn begin_exclusive(&self, timeout: Duration) -> Result<Self::Transaction<'_>, StoreError>;

    /// Query a window of rows matching `predicate`, ordered by id.
    fn query(&self, table: &str, predicate: &SqlFragment, window: Window)
        -> Result<Page, StoreError>;

    /// Insert a row, returning its new etag.
    fn insert(&self, table: &str, row: &Row) -> Result<String, StoreError>;

    /// Update a row if its etag still matches, returning the new etag.
    fn update(
        &self,
        table: &str,
        id: &str,
        etag: &str,
        values: &[(String, SqlValue)],
    ) -> Result<String, StoreError>;

    /// Delete a row if its etag still matches.
    fn delete(&self, table: &str, id: &str, etag: &str) -> Result<(), StoreError>;

    /// Execute a statement outside any migration transaction.
    fn raw_execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError>;
}

/// Generate a fresh etag.
pub fn new_etag() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// SQLite store on a single connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for SqliteStore {
    type Transaction<'a> = SqliteTransaction<'a>;

    fn begin_exclusive(&self, timeout: Duration) -> Result<SqliteTransaction<'_>, StoreError> {
        let waited_ms = timeout.as_millis() as u64;
        let conn = self
            .conn
            .try_lock_for(timeout)
            .ok_or(StoreError::LockTimeout { waited_ms })?;

        conn.busy_timeout(timeout)?;
        let begun = conn.execute_batch("BEGIN EXCLUSIVE");
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        match begun {
            Ok(()) => {
                debug!(timeout_ms = waited_ms, "Exclusive transaction started");
                Ok(SqliteTransaction {
                    conn,
                    finished: false,
                })
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Err(StoreError::LockTimeout { waited_ms })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn query(
        &self,
        table: &str,
        predicate: &SqlFragment,
        window: Window,
    ) -> Result<Page, StoreError> {
        let conn = self.conn.lock();
        let table_sql = quote_ident(table);

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {}", table_sql, predicate.sql),
            params_from_iter(predicate.params.iter()),
            |r| r.get(0),
        )?;

        let mut params = predicate.params.clone();
        params.push(SqlValue::Integer(window.take as i64));
        params.push(SqlValue::Integer(window.skip as i64));
        let rows = select_rows(
            &conn,
            &format!(
                "SELECT * FROM {} WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
                table_sql,
                predicate.sql,
                quote_ident(columns::ID)
            ),
            &params,
        )?;

        Ok(Page {
            rows,
            total: total as usize,
        })
    }

    fn insert(&self, table: &str, row: &Row) -> Result<String, StoreError> {
        let etag = new_etag();
        let mut names = Vec::new();
        let mut params = Vec::new();
        for (name, value) in row.iter() {
            if name.eq_ignore_ascii_case(columns::ETAG) {
                continue;
            }
            names.push(quote_ident(name));
            params.push(value.clone());
        }
        names.push(quote_ident(columns::ETAG));
        params.push(SqlValue::from(etag.as_str()));

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );
        self.conn.lock().execute(&sql, params_from_iter(params.iter()))?;
        Ok(etag)
    }

    fn update(
        &self,
        table: &str,
        id: &str,
        etag: &str,
        values: &[(String, SqlValue)],
    ) -> Result<String, StoreError> {
        let new_etag = new_etag();
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (name, value) in values {
            if name.eq_ignore_ascii_case(columns::ETAG) || name.eq_ignore_ascii_case(columns::ID) {
                return Err(StoreError::InvalidData(format!(
                    "column '{}' cannot be assigned directly",
                    name
                )));
            }
            assignments.push(format!("{} = ?", quote_ident(name)));
            params.push(value.clone());
        }
        assignments.push(format!("{} = ?", quote_ident(columns::ETAG)));
        params.push(SqlValue::from(new_etag.as_str()));
        params.push(SqlValue::from(id));
        params.push(SqlValue::from(etag));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ? AND {} = ?",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(columns::ID),
            quote_ident(columns::ETAG)
        );
        let changed = self.conn.lock().execute(&sql, params_from_iter(params.iter()))?;
        if changed == 0 {
            return Err(StoreError::ConcurrencyConflict {
                table: table.to_string(),
                id: id.to_string(),
            });
        }

        Ok(new_etag)
    }

    fn delete(&self, table: &str, id: &str, etag: &str) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
            quote_ident(table),
            quote_ident(columns::ID),
            quote_ident(columns::ETAG)
        );
        let changed = self.conn.lock().execute(&sql, [id, etag])?;
        if changed == 0 {
            return Err(StoreError::ConcurrencyConflict {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn raw_execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError> {
        Ok(self.conn.lock().execute(sql, params_from_iter(params.iter()))?)
    }
}

/// Exclusive SQLite transaction. Holds the store's connection until
/// committed, rolled back or dropped.
pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), StoreError> {
        Ok(self.conn.execute_batch(sql)?)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        select_rows(&self.conn, sql, params)
    }

    fn actual_schema(&mut self) -> Result<ActualSchema, StoreError> {
        let names: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                 UNION \
                 SELECT name FROM sqlite_temp_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            names
        };

        let mut schema = ActualSchema::empty();
        let mut stmt = self.conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
        for name in names {
            let columns = stmt
                .query_map([&name], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            schema.insert(name, columns);
        }

        Ok(schema)
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}

fn select_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let mut row = Row::new();
        for (idx, name) in names.iter().enumerate() {
            row.insert(name.clone(), SqlValue::from(r.get_ref(idx)?));
        }
        out.push(row);
    }

    Ok(out)
}
