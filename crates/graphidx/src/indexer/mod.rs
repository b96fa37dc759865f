//! The indexing operation seam.
//!
//! The orchestrator never indexes anything itself; it hands a workspace's
//! data path and the job's config to an [`IndexingOperation`] and records
//! what comes back.

pub mod command;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job::{IndexingConfig, IndexingResult, ProgressUpdate};

pub use command::CommandIndexer;

/// How an indexing run ended when it did not succeed.
///
/// Captured into the job record as a failure (or cancellation); never
/// surfaced to callers of the manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("indexing cancelled")]
    Cancelled,

    #[error("indexing timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("indexing operation panicked: {0}")]
    Panicked(String),
}

/// What a successful run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingOutcome {
    pub files_processed: u64,
    pub entities_extracted: u64,
    pub relationships_extracted: u64,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl IndexingOutcome {
    pub fn into_result(self, elapsed: Duration) -> IndexingResult {
        IndexingResult {
            files_processed: self.files_processed,
            entities_extracted: self.entities_extracted,
            relationships_extracted: self.relationships_extracted,
            artifacts: self.artifacts,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Sends progress snapshots back to the runner.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressUpdate>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressUpdate>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// A reporter whose updates go nowhere.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(tx, CancellationToken::new())
    }

    /// Queues a snapshot. Waits when the runner is behind; returns
    /// immediately once cancellation was requested or the runner is gone.
    pub async fn report(&self, update: ProgressUpdate) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(update) => {}
        }
    }
}

/// Everything one run needs.
#[derive(Debug, Clone)]
pub struct IndexingContext {
    pub job_id: String,
    pub workspace_id: String,
    pub data_path: PathBuf,
    pub config: IndexingConfig,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

impl IndexingContext {
    /// Cancellation checkpoint. Operations call this between stages.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The long-running corpus indexing computation.
///
/// Implementations must call [`IndexingContext::checkpoint`] (or watch
/// `ctx.cancel`) at bounded intervals, and must release whatever they hold
/// when their future is dropped.
#[async_trait]
pub trait IndexingOperation: Send + Sync {
    async fn run(&self, ctx: IndexingContext) -> Result<IndexingOutcome, ExecutionError>;
}
