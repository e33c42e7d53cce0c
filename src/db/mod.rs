//! SQLite-backed persistence for per-user session state and workflows.
//!
//! The database lives at `~/.dailyos/assistant.db` unless `EngineConfig`
//! names another path. Each user owns exactly one `user_sessions` row
//! (awaiting state, references, displayed lists as one JSON blob) and any
//! number of `workflows` rows, of which at most one is non-terminal.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::Connection;

pub mod sessions;
pub mod types;
pub mod workflows;
pub use types::*;

pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Open (or create) the database at `~/.dailyos/assistant.db` and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL keeps readers unblocked while a turn writes its session row
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        log::debug!("Opened assistant database at {}", path.display());
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.dailyos/assistant.db`.
    pub fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".dailyos").join("assistant.db"))
    }

    /// Open the configured path, or the default one.
    pub fn open_configured(path: Option<&Path>) -> Result<Self, DbError> {
        match path {
            Some(p) => Self::open_at(p.to_path_buf()),
            None => Self::open(),
        }
    }
}

/// Thread-safe handle shared by the session store and workflow machine.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so every access goes
/// through a short-lived lock.
pub struct SqliteStore {
    db: Mutex<EngineDb>,
}

impl SqliteStore {
    pub fn new(db: EngineDb) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn with_db<T>(&self, f: impl FnOnce(&EngineDb) -> Result<T, DbError>) -> Result<T, DbError> {
        let guard = self.db.lock();
        f(&guard)
    }
}


// =============================================================================
// Tests
// =============================================================================
