use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::migrations;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
                       PRAGMA foreign_keys = ON;
                       PRAGMA synchronous = NORMAL;";

/// Thread-safe SQLite connection wrapper.
///
/// Uses `parking_lot::Mutex` for synchronous access; cloning shares the
/// same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at `path` and run pending migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let db = Self::init(conn, path.to_owned())?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    /// Open from settings; `:memory:` selects [`Database::in_memory`].
    pub fn from_settings(settings: &convo_settings::DatabaseSettings) -> Result<Self> {
        if settings.path == ":memory:" {
            Self::in_memory()
        } else {
            Self::open(
                Path::new(&settings.path),
                Duration::from_millis(settings.busy_timeout_ms),
            )
        }
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Migration {
                message: format!("pragmas: {e}"),
            })?;
        let _ = migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
    }

    #[test]
    fn foreign_keys_enabled() {
        let db = Database::in_memory().unwrap();
        let on: i64 = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(on, 1);
    }

    #[test]
    fn open_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let db = Database::open(&path, Duration::from_millis(100)).unwrap();
        assert!(path.exists());
        let db2 = Database::open(&path, Duration::from_millis(100)).unwrap();
        let version = db2
            .with_conn(migrations::current_version)
            .unwrap();
        assert_eq!(version, migrations::latest_version());
        drop(db);
    }

    #[test]
    fn wal_mode_on_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("wal.db"), Duration::from_millis(100)).unwrap();
        let mode: String = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
