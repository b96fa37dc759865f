//! Job store seam and its SQLite implementation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::record::{IndexingJob, JobStatus, JobSummary};
use crate::db::stats_repo::IndexingStats;
use crate::db::{job_repo, stats_repo, Database};
use crate::error::JobError;

/// Durable storage for job records.
///
/// Implementations persist every mutation before returning. `modify` is the
/// only read-modify-write entry point and must serialize writers per job.
pub trait JobStore: Send + Sync {
    /// Inserts or overwrites `job`.
    fn put(&self, job: &IndexingJob) -> Result<(), JobError>;

    /// Fails with `NotFound` when absent.
    fn get(&self, id: &str) -> Result<IndexingJob, JobError>;

    /// Newest first; `limit` caps the number of summaries.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobSummary>, JobError>;

    /// Every job of one workspace, newest first.
    fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<IndexingJob>, JobError>;

    /// IDs in `status`, oldest first.
    fn list_ids_by_status(&self, status: JobStatus) -> Result<Vec<String>, JobError>;

    /// Atomically applies `f` to job `id`. Nothing is written when `f` fails.
    fn modify(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut IndexingJob) -> Result<(), JobError>,
    ) -> Result<IndexingJob, JobError>;

    fn stats(&self, window_start: DateTime<Utc>, window_hours: u32)
        -> Result<IndexingStats, JobError>;
}

/// [`JobStore`] backed by the `indexing_jobs` table.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl JobStore for SqliteJobStore {
    fn put(&self, job: &IndexingJob) -> Result<(), JobError> {
        Ok(job_repo::upsert(&self.db, job)?)
    }

    fn get(&self, id: &str) -> Result<IndexingJob, JobError> {
        job_repo::find_by_id(&self.db, id)?.ok_or_else(|| JobError::job_not_found(id))
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobSummary>, JobError> {
        let filter = job_repo::JobFilter {
            status,
            workspace_id: None,
            limit: Some(limit as u64),
        };
        Ok(job_repo::query_summaries(&self.db, &filter)?)
    }

    fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<IndexingJob>, JobError> {
        let filter = job_repo::JobFilter {
            workspace_id: Some(workspace_id.to_string()),
            ..Default::default()
        };
        Ok(job_repo::query(&self.db, &filter)?)
    }

    fn list_ids_by_status(&self, status: JobStatus) -> Result<Vec<String>, JobError> {
        Ok(job_repo::ids_by_status(&self.db, status)?)
    }

    fn modify(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut IndexingJob) -> Result<(), JobError>,
    ) -> Result<IndexingJob, JobError> {
        job_repo::modify(&self.db, id, |job: &mut IndexingJob| f(job))?
            .ok_or_else(|| JobError::job_not_found(id))
    }

    fn stats(
        &self,
        window_start: DateTime<Utc>,
        window_hours: u32,
    ) -> Result<IndexingStats, JobError> {
        Ok(stats_repo::summary(&self.db, window_start, window_hours)?)
    }
}

/// Bounded retry of store calls that failed with a transient error.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    /// Total tries, including the first.
    pub attempts: usize,
    pub base_delay: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl StoreRetry {
    pub fn new(attempts: usize, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Delays between tries: `base`, `2*base`, `4*base`... with jitter.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.attempts.saturating_sub(1))
    }

    /// Runs `op` until it succeeds, fails permanently, or tries run out.
    pub async fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, JobError>
    where
        F: FnMut() -> Result<T, JobError>,
    {
        let mut tries = 0usize;
        RetryIf::spawn(
            self.strategy(),
            || {
                tries += 1;
                let result = op();
                if let Err(ref e) = result {
                    if e.is_transient() {
                        tracing::warn!(operation = what, attempt = tries, error = %e, "Store call failed");
                    }
                }
                std::future::ready(result)
            },
            |e: &JobError| e.is_transient(),
        )
        .await
    }
}
