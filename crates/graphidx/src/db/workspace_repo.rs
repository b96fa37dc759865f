//! Workspace repository: the slice of the `workspaces` table the
//! orchestrator needs: registration, lookup, and the indexing hold.

use rusqlite::{params, OptionalExtension, Row};

use super::{format_timestamp, Database, DatabaseError};

/// A raw workspace row from the database.
#[derive(Debug, Clone)]
pub struct WorkspaceRow {
    pub id: String,
    pub name: String,
    pub data_path: String,
    pub status: String,
    pub active_job_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkspaceRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            data_path: row.get("data_path")?,
            status: row.get("status")?,
            active_job_id: row.get("active_job_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new workspace row.
pub fn insert(db: &Database, ws: &WorkspaceRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO workspaces (id, name, data_path, status, active_job_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ws.id,
                ws.name,
                ws.data_path,
                ws.status,
                ws.active_job_id,
                ws.created_at,
                ws.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a workspace by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<WorkspaceRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT id, name, data_path, status, active_job_id, created_at, updated_at
                 FROM workspaces WHERE id = ?1",
                params![id],
                WorkspaceRow::from_row,
            )
            .optional()?)
    })
}

/// Lists all workspaces by name.
pub fn list(db: &Database) -> Result<Vec<WorkspaceRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, name, data_path, status, active_job_id, created_at, updated_at
             FROM workspaces ORDER BY name ASC",
        )?;
        let rows = stmt
            .query_map([], WorkspaceRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Takes the indexing hold for `job_id`.
///
/// Succeeds when the workspace is free or already held by the same job.
/// Returns `false` when it is missing or another job holds it.
pub fn mark_indexing(db: &Database, id: &str, job_id: &str) -> Result<bool, DatabaseError> {
    let now = format_timestamp(chrono::Utc::now());
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE workspaces SET status = 'indexing', active_job_id = ?2, updated_at = ?3
             WHERE id = ?1 AND (status != 'indexing' OR active_job_id = ?2)",
            params![id, job_id, now],
        )?;
        Ok(changed == 1)
    })
}

/// Drops the hold of `job_id`. A hold owned by another job is left alone.
pub fn release_indexing(db: &Database, id: &str, job_id: &str) -> Result<bool, DatabaseError> {
    let now = format_timestamp(chrono::Utc::now());
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE workspaces SET status = 'ready', active_job_id = NULL, updated_at = ?3
             WHERE id = ?1 AND active_job_id = ?2",
            params![id, job_id, now],
        )?;
        Ok(changed == 1)
    })
}
