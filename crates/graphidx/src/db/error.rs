use std::path::PathBuf;
use thiserror::Error;

/// Failure talking to the job database.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cannot prepare database directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A thread panicked while holding the connection.
    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Corrupt row '{id}' in {table}: {reason}")]
    CorruptRow {
        table: &'static str,
        id: String,
        reason: String,
    },

    #[error("Failed to encode JSON column: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DatabaseError {
    /// Whether the same call may succeed once the database frees up.
    /// Corrupt or unencodable data and failed migrations are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            DatabaseError::Io { .. } | DatabaseError::LockPoisoned => true,
            _ => false,
        }
    }
}
