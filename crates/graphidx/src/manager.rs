//! Indexing manager: the public contract for creating, inspecting,
//! cancelling and retrying indexing jobs.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::broadcast::{JobEvent, JobEventBroadcaster, JobEventKind};
use crate::config::OrchestratorConfig;
use crate::db::stats_repo::IndexingStats;
use crate::db::Database;
use crate::error::JobError;
use crate::indexer::IndexingOperation;
use crate::job::{
    retry, IndexingConfig, IndexingJob, JobStatus, JobStore, JobSummary, SqliteJobStore,
    StoreRetry,
};
use crate::worker::Scheduler;
use crate::workspace::{SqliteWorkspaces, WorkspaceDirectory};

/// Permission required to create, cancel or retry jobs.
pub const WRITE_PERMISSION: &str = "indexing:write";

/// Listing limit used when the caller does not pass one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Authenticated identity of whoever is calling the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub subject: String,
    pub permissions: HashSet<String>,
}

impl Caller {
    pub fn new<I, S>(subject: &str, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subject: subject.to_string(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    /// Local operator with full access.
    pub fn system() -> Self {
        Self::new("system", [WRITE_PERMISSION])
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    fn require(&self, permission: &str) -> Result<(), JobError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(JobError::PermissionDenied(format!(
                "'{}' lacks '{}'",
                self.subject, permission
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub config: IndexingConfig,
    /// Falls back to the configured default.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl CreateJobRequest {
    pub fn new(workspace_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            config: IndexingConfig::default(),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub default_max_retries: u32,
    pub store_retry: StoreRetry,
    pub stats_window_hours: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            store_retry: StoreRetry::default(),
            stats_window_hours: 24,
        }
    }
}

impl From<&OrchestratorConfig> for ManagerSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            default_max_retries: config.default_max_retries,
            store_retry: config.store_retry(),
            stats_window_hours: config.stats_window_hours,
        }
    }
}

pub struct IndexingManager {
    store: Arc<dyn JobStore>,
    workspaces: Arc<dyn WorkspaceDirectory>,
    scheduler: Arc<Scheduler>,
    events: JobEventBroadcaster,
    settings: ManagerSettings,
}

impl IndexingManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        workspaces: Arc<dyn WorkspaceDirectory>,
        scheduler: Arc<Scheduler>,
        events: JobEventBroadcaster,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            workspaces,
            scheduler,
            events,
            settings,
        }
    }

    /// Wires the SQLite store, workspaces and a scheduler around `operation`.
    /// The scheduler is not started.
    pub fn from_config(
        db: &Database,
        operation: Arc<dyn IndexingOperation>,
        config: &OrchestratorConfig,
    ) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone()));
        let workspaces: Arc<dyn WorkspaceDirectory> = Arc::new(SqliteWorkspaces::new(db.clone()));
        let events = JobEventBroadcaster::new(config.event_capacity);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&workspaces),
            operation,
            events.clone(),
            config.scheduler_settings(),
        ));
        Self::new(store, workspaces, scheduler, events, config.into())
    }

    /// Starts the scheduler. Returns how many interrupted jobs were recovered.
    pub async fn start(&self) -> Result<usize, JobError> {
        self.scheduler.start().await
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Persists a QUEUED job for the workspace and hands it to the scheduler.
    #[instrument(skip_all, fields(workspace_id = %request.workspace_id, caller = %caller.subject))]
    pub async fn create_job(
        &self,
        caller: &Caller,
        request: CreateJobRequest,
    ) -> Result<IndexingJob, JobError> {
        caller.require(WRITE_PERMISSION)?;

        let workspace_id = request.workspace_id.trim();
        if workspace_id.is_empty() {
            return Err(JobError::Validation(
                "workspace_id must not be empty".to_string(),
            ));
        }
        request.config.validate()?;

        let store_retry = self.settings.store_retry;
        let workspace = store_retry
            .run("get workspace", || self.workspaces.get_workspace(workspace_id))
            .await?
            .ok_or_else(|| JobError::workspace_not_found(workspace_id))?;

        if workspace.data_path.as_os_str().is_empty() {
            return Err(JobError::Validation(format!(
                "workspace {} has no data path",
                workspace.id
            )));
        }
        if workspace.is_indexing() {
            return Err(JobError::InvalidState(format!(
                "workspace {} is already being indexed by job {}",
                workspace.id,
                workspace.active_job_id.as_deref().unwrap_or("unknown")
            )));
        }

        let job = IndexingJob::new(
            &workspace.id,
            request.config,
            request
                .max_retries
                .unwrap_or(self.settings.default_max_retries),
            Some(&caller.subject),
        );

        let marked = store_retry
            .run("mark workspace", || {
                self.workspaces.mark_indexing(&workspace.id, &job.id)
            })
            .await?;
        if !marked {
            return Err(JobError::InvalidState(format!(
                "workspace {} is already being indexed",
                workspace.id
            )));
        }

        if let Err(e) = store_retry.run("insert job", || self.store.put(&job)).await {
            self.release(&workspace.id, &job.id);
            return Err(e);
        }

        info!(job_id = %job.id, "Indexing job queued");
        self.events.publish(JobEventKind::Queued, &job);
        self.scheduler.enqueue(&job.id);
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<IndexingJob, JobError> {
        self.settings
            .store_retry
            .run("get job", || self.store.get(id))
            .await
    }

    /// Newest first. `limit` defaults to [`DEFAULT_LIST_LIMIT`].
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<JobSummary>, JobError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        self.settings
            .store_retry
            .run("list jobs", || self.store.list(status, limit))
            .await
    }

    pub async fn get_jobs_for_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<IndexingJob>, JobError> {
        let store_retry = self.settings.store_retry;
        store_retry
            .run("get workspace", || self.workspaces.get_workspace(workspace_id))
            .await?
            .ok_or_else(|| JobError::workspace_not_found(workspace_id))?;
        store_retry
            .run("list workspace jobs", || {
                self.store.list_for_workspace(workspace_id)
            })
            .await
    }

    /// Cancels a QUEUED or RUNNING job. Returns `false` when it already
    /// reached a terminal state.
    #[instrument(skip_all, fields(job_id = %id, caller = %caller.subject))]
    pub async fn cancel_job(&self, caller: &Caller, id: &str) -> Result<bool, JobError> {
        caller.require(WRITE_PERMISSION)?;

        let result = self
            .settings
            .store_retry
            .run("cancel job", || {
                self.store
                    .modify(id, &mut |job: &mut IndexingJob| job.cancel())
            })
            .await;

        match result {
            Ok(job) => {
                self.release(&job.workspace_id, &job.id);
                let signalled = self.scheduler.cancel(id);
                info!(signalled, "Indexing job cancelled");
                self.events.publish(JobEventKind::Cancelled, &job);
                Ok(true)
            }
            Err(JobError::InvalidState(reason)) => {
                debug!(%reason, "Cancel ignored");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-queues a FAILED job with retries left. Returns `false` when the
    /// retry policy refuses.
    #[instrument(skip_all, fields(job_id = %id, caller = %caller.subject))]
    pub async fn retry_job(&self, caller: &Caller, id: &str) -> Result<bool, JobError> {
        caller.require(WRITE_PERMISSION)?;

        let store_retry = self.settings.store_retry;
        let job = store_retry.run("get job", || self.store.get(id)).await?;
        if !retry::can_retry(&job) {
            debug!(
                status = %job.status,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                "Retry refused"
            );
            return Ok(false);
        }

        store_retry
            .run("get workspace", || self.workspaces.get_workspace(&job.workspace_id))
            .await?
            .ok_or_else(|| JobError::workspace_not_found(&job.workspace_id))?;
        let marked = store_retry
            .run("mark workspace", || {
                self.workspaces.mark_indexing(&job.workspace_id, &job.id)
            })
            .await?;
        if !marked {
            return Err(JobError::InvalidState(format!(
                "workspace {} is being indexed by another job",
                job.workspace_id
            )));
        }

        let result = store_retry
            .run("reset job", || {
                self.store
                    .modify(id, &mut |j: &mut IndexingJob| j.reset_for_retry())
            })
            .await;

        match result {
            Ok(job) => {
                info!(retry_count = job.retry_count, "Indexing job re-queued");
                self.events.publish(JobEventKind::Retried, &job);
                self.scheduler.enqueue(&job.id);
                Ok(true)
            }
            Err(JobError::InvalidState(reason)) => {
                // Lost a race with another retry.
                debug!(%reason, "Retry refused");
                self.release(&job.workspace_id, &job.id);
                Ok(false)
            }
            Err(e) => {
                self.release(&job.workspace_id, &job.id);
                Err(e)
            }
        }
    }

    /// Same answer `retry_job` would act on.
    pub async fn can_retry(&self, id: &str) -> Result<bool, JobError> {
        let job = self.get_job(id).await?;
        Ok(retry::can_retry(&job))
    }

    pub async fn get_indexing_stats(&self) -> Result<IndexingStats, JobError> {
        let hours = self.settings.stats_window_hours;
        let window_start = Utc::now() - chrono::Duration::hours(i64::from(hours));
        self.settings
            .store_retry
            .run("job stats", || self.store.stats(window_start, hours))
            .await
    }

    /// Stops the scheduler and waits for running jobs to settle.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    fn release(&self, workspace_id: &str, job_id: &str) {
        if let Err(e) = self.workspaces.release_indexing(workspace_id, job_id) {
            tracing::warn!(workspace_id, job_id, error = %e, "Failed to release workspace");
        }
    }
}
