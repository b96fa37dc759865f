//! SQLite persistence shared by the job store and the workspace directory.
//!
//! One connection per process, guarded by a mutex. The repositories are free
//! functions taking a [`Database`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod stats_repo;
pub mod workspace_repo;

pub use error::DatabaseError;

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable handle to the orchestrator database.
///
/// File databases run in WAL mode so the CLI can read while a `serve`
/// process writes.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens `path`, creating missing parent directories, and migrates it.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DatabaseError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let db = Self::migrated(conn)?;
        log::info!("Opened job database {}", path.display());
        Ok(db)
    }

    /// Private, migrated in-memory database.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(Connection::open_in_memory()?)
    }

    fn migrated(mut conn: Connection) -> Result<Self, DatabaseError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::run_all(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` while holding the connection lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let guard = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&guard)
    }
}

/// Returns the canonical database path: `~/.graphidx/data/graphidx.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".graphidx").join("data").join("graphidx.db"))
}

/// Fixed-width RFC 3339 so that string order equals time order.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(
    table: &'static str,
    id: &str,
    value: &str,
) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::CorruptRow {
            table,
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", value, e),
        })
}
