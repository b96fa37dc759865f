use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum GraphidxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Errors surfaced synchronously by the indexing manager.
///
/// Execution failures of the indexing operation are not represented here;
/// they are recorded on the job itself.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Job store unavailable: {0}")]
    Store(#[from] DatabaseError),
}

impl JobError {
    pub fn job_not_found(id: &str) -> Self {
        JobError::NotFound {
            kind: "Job",
            id: id.to_string(),
        }
    }

    pub fn workspace_not_found(id: &str) -> Self {
        JobError::NotFound {
            kind: "Workspace",
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call may succeed without caller changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Store(e) if e.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, GraphidxError>;
