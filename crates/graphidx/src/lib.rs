//! Orchestration of knowledge-graph indexing jobs.
//!
//! An [`IndexingManager`] accepts job requests for a workspace, persists
//! them in a [`JobStore`], and a [`Scheduler`] runs them through an
//! [`IndexingOperation`] with bounded concurrency, timeouts, cooperative
//! cancellation and explicit retries.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod job;
pub mod manager;
pub mod telemetry;
pub mod worker;
pub mod workspace;

pub use api::{ApiResponse, ApiStatus};
pub use broadcast::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use config::{load_config, load_config_or_default, OrchestratorConfig};
pub use db::stats_repo::{IndexingStats, RecentActivity};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, GraphidxError, JobError, Result};
pub use indexer::{
    CommandIndexer, ExecutionError, IndexingContext, IndexingOperation, IndexingOutcome,
    ProgressReporter,
};
pub use job::{
    can_retry, IndexingConfig, IndexingJob, IndexingResult, JobStatus, JobStore, JobSummary,
    ProgressUpdate, SqliteJobStore, StoreRetry,
};
pub use manager::{Caller, CreateJobRequest, IndexingManager, ManagerSettings, WRITE_PERMISSION};
pub use worker::{Scheduler, SchedulerSettings};
pub use workspace::{SqliteWorkspaces, Workspace, WorkspaceDirectory, WorkspaceStatus};
