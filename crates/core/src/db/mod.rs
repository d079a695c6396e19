//! SQLite persistence layer for dgnsync.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, and query helpers for every identity table. The same handle
//! backs the [`SqliteTarget`](crate::target::SqliteTarget), so identity
//! mappings and target content share one transaction boundary.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode and uses `PRAGMA foreign_keys = ON`.
/// The inner connection is wrapped in a `Mutex` so that `Database` is
/// `Send + Sync`, enabling use inside `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure atomically. Uses a savepoint so it nests inside an
    /// open run transaction; committed on `Ok`, rolled back otherwise.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let sp = conn.savepoint()?;
        let result = f(&sp)?;
        sp.commit()?;
        Ok(result)
    }

    // -- run transaction ----------------------------------------------------

    /// Open the long-lived write transaction if none is open. Returns `true`
    /// when a new transaction was started.
    pub fn begin(&self) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        if !conn.is_autocommit() {
            return Ok(false);
        }
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        debug!("began write transaction");
        Ok(true)
    }

    /// `true` while a write transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.conn().is_autocommit()
    }

    /// Commit the open write transaction, if any.
    pub fn save_changes(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("COMMIT;")?;
        debug!("committed write transaction");
        Ok(())
    }

    /// Roll back the open write transaction, if any.
    pub fn abandon_changes(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK;")?;
        debug!("rolled back write transaction");
        Ok(())
    }

    /// Names from `tables` that do not exist in the database.
    pub fn missing_tables(&self, tables: &[&str]) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
        let mut missing = Vec::new();
        for table in tables {
            let count: i64 = stmt.query_row([table], |row| row.get(0))?;
            if count == 0 {
                missing.push(table.to_string());
            }
        }
        Ok(missing)
    }
}
