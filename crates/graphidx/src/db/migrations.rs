//! Schema versions for the job database.
//!
//! Applied versions are recorded in `_migrations`; anything newer runs on
//! open. ADD COLUMN steps are skipped when the column is already present
//! so a hand-patched database still migrates.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const CREATE_WORKSPACES: &str = "
CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    data_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ready',
    active_job_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);";

const CREATE_INDEXING_JOBS: &str = "
CREATE TABLE IF NOT EXISTS indexing_jobs (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    config TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    stage TEXT,
    progress_percentage INTEGER NOT NULL DEFAULT 0,
    result TEXT,
    error_message TEXT,
    files_processed INTEGER NOT NULL DEFAULT 0,
    entities_extracted INTEGER NOT NULL DEFAULT 0,
    relationships_extracted INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_status ON indexing_jobs(status);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_workspace ON indexing_jobs(workspace_id);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_created_at ON indexing_jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_status_created_at
    ON indexing_jobs(status, created_at);";

const ADD_CREATED_BY: &str = "ALTER TABLE indexing_jobs ADD COLUMN created_by TEXT;";

const ADD_LEASE_OWNER: &str = "ALTER TABLE indexing_jobs ADD COLUMN lease_owner TEXT;";

const ADD_LEASE_EXPIRES_AT: &str =
    "ALTER TABLE indexing_jobs ADD COLUMN lease_expires_at TEXT;";

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_workspaces_table",
        sql: CREATE_WORKSPACES,
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_indexing_jobs_table",
        sql: CREATE_INDEXING_JOBS,
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "add_created_by_to_indexing_jobs",
        sql: ADD_CREATED_BY,
        kind: MigrationKind::AddColumn {
            table: "indexing_jobs",
            column: "created_by",
        },
    },
    Migration {
        version: 4,
        description: "add_lease_owner_to_indexing_jobs",
        sql: ADD_LEASE_OWNER,
        kind: MigrationKind::AddColumn {
            table: "indexing_jobs",
            column: "lease_owner",
        },
    },
    Migration {
        version: 5,
        description: "add_lease_expires_at_to_indexing_jobs",
        sql: ADD_LEASE_EXPIRES_AT,
        kind: MigrationKind::AddColumn {
            table: "indexing_jobs",
            column: "lease_expires_at",
        },
    },
];

/// Version of the newest known migration.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

impl Migration {
    /// `false` when the change is already present in the schema.
    fn needed(&self, conn: &Connection) -> Result<bool, DatabaseError> {
        match self.kind {
            MigrationKind::Standard => Ok(true),
            MigrationKind::AddColumn { table, column } => {
                Ok(!column_exists(conn, table, column)?)
            }
        }
    }

    fn failed(&self, e: rusqlite::Error) -> DatabaseError {
        DatabaseError::Migration {
            version: self.version,
            reason: e.to_string(),
        }
    }
}

/// Brings the schema up to [`latest_version`]. Each migration commits
/// together with its `_migrations` row.
pub fn run_all(conn: &mut Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for migration in pending {
        let tx = conn.transaction()?;
        if migration.needed(&tx)? {
            log::info!("Applying migration v{} ({})", migration.version, migration.description);
            tx.execute_batch(migration.sql)
                .map_err(|e| migration.failed(e))?;
        } else {
            log::info!("Migration v{} already reflected in schema", migration.version);
        }
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let valid = !table.is_empty() && table.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if !valid {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let columns: Vec<String> = conn
        .prepare(&format!("PRAGMA table_info({})", table))?
        .query_map([], |row| row.get(1))?
        .collect::<Result<_, _>>()?;
    Ok(columns.iter().any(|c| c == column))
}
