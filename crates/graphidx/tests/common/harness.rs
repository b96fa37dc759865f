//! Test harness for isolated orchestrator runs.
//!
//! Every harness owns a temporary directory holding the SQLite database and
//! the workspace corpora, so a second harness can be opened on the same
//! database to simulate a restart.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use graphidx::{
    Caller, CreateJobRequest, Database, IndexingJob, IndexingManager, JobEventBroadcaster,
    JobStatus, JobStore, ManagerSettings, Scheduler, SchedulerSettings, SqliteJobStore,
    SqliteWorkspaces, StoreRetry, Workspace, WorkspaceDirectory,
};

use super::fakes::{Behavior, FlakyStore, ScriptedIndexer};

/// Scheduler settings tuned for fast tests.
pub fn fast_settings() -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_jobs: 2,
        job_timeout: Duration::from_secs(10),
        cancel_grace: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        lease_ttl: Duration::from_secs(1),
        store_retry: fast_retry(),
    }
}

const DB_FILE: &str = "graphidx.db";

pub fn fast_retry() -> StoreRetry {
    StoreRetry::new(3, Duration::from_millis(2))
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub db: Database,
    pub store: Arc<FlakyStore>,
    pub workspaces: Arc<SqliteWorkspaces>,
    pub indexer: Arc<ScriptedIndexer>,
    pub manager: IndexingManager,
    pub caller: Caller,
}

impl TestHarness {
    /// Harness whose indexer always behaves like `fallback`.
    pub fn new(fallback: Behavior) -> Self {
        Self::with_indexer(ScriptedIndexer::new(fallback), fast_settings())
    }

    pub fn with_indexer(indexer: ScriptedIndexer, settings: SchedulerSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::open(temp_dir, indexer, settings)
    }

    /// Drops the scheduler and opens a fresh one on the same database.
    pub async fn restart(self, indexer: ScriptedIndexer) -> Self {
        let settings = self.manager.scheduler().settings().clone();
        self.manager.shutdown().await;
        let TestHarness { temp_dir, .. } = self;
        Self::open(temp_dir, indexer, settings)
    }

    fn open(temp_dir: TempDir, indexer: ScriptedIndexer, settings: SchedulerSettings) -> Self {
        let db = Database::open(&temp_dir.path().join(DB_FILE))
            .expect("Failed to open database");
        let store = Arc::new(FlakyStore::new(SqliteJobStore::new(db.clone())));
        let workspaces = Arc::new(SqliteWorkspaces::new(db.clone()));
        let indexer = Arc::new(indexer);
        let events = JobEventBroadcaster::default();

        let store_retry = settings.store_retry;
        let scheduler = Arc::new(Scheduler::new(
            store.clone() as Arc<dyn JobStore>,
            workspaces.clone() as Arc<dyn WorkspaceDirectory>,
            indexer.clone(),
            events.clone(),
            settings,
        ));
        let manager = IndexingManager::new(
            store.clone(),
            workspaces.clone(),
            scheduler,
            events,
            ManagerSettings {
                default_max_retries: 3,
                store_retry,
                stats_window_hours: 24,
            },
        );

        Self {
            temp_dir,
            db,
            store,
            workspaces,
            indexer,
            manager,
            caller: Caller::system(),
        }
    }

    /// A second scheduler and manager on the same database file, with its
    /// own connection, as another process would open it.
    pub fn peer(&self, indexer: Arc<ScriptedIndexer>) -> IndexingManager {
        let db = Database::open(&self.temp_dir.path().join(DB_FILE))
            .expect("Failed to open database");
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone()));
        let workspaces: Arc<dyn WorkspaceDirectory> = Arc::new(SqliteWorkspaces::new(db));
        let events = JobEventBroadcaster::default();
        let settings = self.manager.scheduler().settings().clone();
        let store_retry = settings.store_retry;
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            workspaces.clone(),
            indexer,
            events.clone(),
            settings,
        ));
        IndexingManager::new(
            store,
            workspaces,
            scheduler,
            events,
            ManagerSettings {
                default_max_retries: 3,
                store_retry,
                stats_window_hours: 24,
            },
        )
    }

    pub fn root(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Registers a workspace with its own corpus directory.
    pub fn workspace(&self, name: &str) -> Workspace {
        let data_path = self.temp_dir.path().join("corpora").join(name);
        std::fs::create_dir_all(&data_path).expect("Failed to create corpus dir");
        self.workspaces
            .register(name, &data_path.to_string_lossy())
            .expect("Failed to register workspace")
    }

    pub fn reload_workspace(&self, id: &str) -> Workspace {
        self.workspaces
            .get_workspace(id)
            .expect("Failed to load workspace")
            .expect("Workspace missing")
    }

    pub async fn start(&self) {
        self.manager.start().await.expect("Failed to start scheduler");
    }

    pub async fn create(&self, workspace: &Workspace) -> IndexingJob {
        self.manager
            .create_job(&self.caller, CreateJobRequest::new(&workspace.id))
            .await
            .expect("Failed to create job")
    }

    pub async fn create_with(&self, request: CreateJobRequest) -> IndexingJob {
        self.manager
            .create_job(&self.caller, request)
            .await
            .expect("Failed to create job")
    }

    pub async fn job(&self, id: &str) -> IndexingJob {
        self.manager.get_job(id).await.expect("Failed to get job")
    }

    /// Polls until job `id` reaches `status`; panics after five seconds.
    pub async fn wait_for_status(&self, id: &str, status: JobStatus) -> IndexingJob {
        self.wait_until(id, |job| job.status == status)
            .await
            .unwrap_or_else(|job| {
                panic!(
                    "job {} never reached {}, last seen {} ({:?})",
                    id, status, job.status, job.error_message
                )
            })
    }

    /// Polls until `done` holds for job `id`. On timeout returns the last
    /// state seen as the error.
    pub async fn wait_until<F>(&self, id: &str, done: F) -> Result<IndexingJob, IndexingJob>
    where
        F: Fn(&IndexingJob) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.job(id).await;
            if done(&job) {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(job);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until no runner owns any job.
    pub async fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.manager.scheduler().active_count() > 0 {
            assert!(Instant::now() < deadline, "scheduler never went idle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
