//! Workspace collaborator: existence checks and the indexing hold.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::workspace_repo::{self, WorkspaceRow};
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::error::JobError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Ready,
    Indexing,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Ready => "ready",
            WorkspaceStatus::Indexing => "indexing",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    /// Root of the corpus the indexer reads.
    pub data_path: PathBuf,
    pub status: WorkspaceStatus,
    /// Job currently holding the indexing flag.
    pub active_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn is_indexing(&self) -> bool {
        self.status == WorkspaceStatus::Indexing
    }

    fn from_row(row: WorkspaceRow) -> Result<Self, DatabaseError> {
        let status = match row.status.as_str() {
            "ready" => WorkspaceStatus::Ready,
            "indexing" => WorkspaceStatus::Indexing,
            other => {
                return Err(DatabaseError::CorruptRow {
                    table: "workspaces",
                    id: row.id,
                    reason: format!("unknown status '{}'", other),
                })
            }
        };
        Ok(Self {
            created_at: parse_timestamp("workspaces", &row.id, &row.created_at)?,
            updated_at: parse_timestamp("workspaces", &row.id, &row.updated_at)?,
            id: row.id,
            name: row.name,
            data_path: PathBuf::from(row.data_path),
            status,
            active_job_id: row.active_job_id,
        })
    }
}

/// Lookup and indexing-flag transitions for workspaces.
///
/// The hold is keyed by job id so that both operations are idempotent:
/// marking twice for the same job succeeds, and releasing only clears a
/// hold owned by that job.
pub trait WorkspaceDirectory: Send + Sync {
    fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, JobError>;

    /// Returns `false` when another job already holds the workspace.
    fn mark_indexing(&self, id: &str, job_id: &str) -> Result<bool, JobError>;

    fn release_indexing(&self, id: &str, job_id: &str) -> Result<(), JobError>;
}

/// [`WorkspaceDirectory`] over the `workspaces` table.
#[derive(Clone)]
pub struct SqliteWorkspaces {
    db: Database,
}

impl SqliteWorkspaces {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers a new workspace with a generated id.
    pub fn register(&self, name: &str, data_path: &str) -> Result<Workspace, JobError> {
        if name.trim().is_empty() {
            return Err(JobError::Validation(
                "workspace name must not be empty".to_string(),
            ));
        }
        if data_path.trim().is_empty() {
            return Err(JobError::Validation(
                "workspace data path must not be empty".to_string(),
            ));
        }

        let now = format_timestamp(crate::job::record::now());
        let row = WorkspaceRow {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            data_path: data_path.to_string(),
            status: WorkspaceStatus::Ready.as_str().to_string(),
            active_job_id: None,
            created_at: now.clone(),
            updated_at: now,
        };
        workspace_repo::insert(&self.db, &row)?;
        log::info!("Registered workspace '{}' ({})", row.name, row.id);
        Ok(Workspace::from_row(row)?)
    }

    pub fn list(&self) -> Result<Vec<Workspace>, JobError> {
        workspace_repo::list(&self.db)?
            .into_iter()
            .map(|row| Workspace::from_row(row).map_err(JobError::from))
            .collect()
    }
}

impl WorkspaceDirectory for SqliteWorkspaces {
    fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, JobError> {
        Ok(workspace_repo::find_by_id(&self.db, id)?
            .map(Workspace::from_row)
            .transpose()?)
    }

    fn mark_indexing(&self, id: &str, job_id: &str) -> Result<bool, JobError> {
        Ok(workspace_repo::mark_indexing(&self.db, id, job_id)?)
    }

    fn release_indexing(&self, id: &str, job_id: &str) -> Result<(), JobError> {
        if !workspace_repo::release_indexing(&self.db, id, job_id)? {
            log::debug!("Workspace {} was not held by job {}", id, job_id);
        }
        Ok(())
    }
}
