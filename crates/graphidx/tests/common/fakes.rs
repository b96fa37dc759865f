//! Indexing operations and stores with scripted behaviour.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use graphidx::{
    DatabaseError, ExecutionError, IndexingContext, IndexingJob, IndexingOperation,
    IndexingOutcome, IndexingStats, JobError, JobStatus, JobStore, JobSummary, ProgressUpdate,
    SqliteJobStore,
};

/// What a [`ScriptedIndexer`] does on one run.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reports each step, pausing `step_delay` between them, then succeeds.
    Succeed {
        steps: Vec<ProgressUpdate>,
        step_delay: Duration,
        outcome: IndexingOutcome,
    },
    Fail(String),
    Panic(String),
    /// Runs until cancelled, honouring the token.
    HangUntilCancelled,
    /// Runs forever and never looks at the token.
    IgnoreCancel,
    /// Sleeps, then succeeds with an empty outcome.
    Sleep(Duration),
}

impl Behavior {
    pub fn succeed() -> Self {
        Behavior::Succeed {
            steps: Vec::new(),
            step_delay: Duration::ZERO,
            outcome: IndexingOutcome::default(),
        }
    }
}

/// Plays queued behaviours in order, then repeats `fallback`.
pub struct ScriptedIndexer {
    script: Mutex<Vec<Behavior>>,
    fallback: Behavior,
    runs: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedIndexer {
    pub fn new(fallback: Behavior) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback,
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Queues behaviours played before the fallback.
    pub fn then(self, behaviors: impl IntoIterator<Item = Behavior>) -> Self {
        self.script.lock().unwrap().extend(behaviors);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of runs observed at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            self.fallback.clone()
        } else {
            script.remove(0)
        }
    }
}

/// Decrements the in-flight counter even when the run is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexingOperation for ScriptedIndexer {
    async fn run(&self, ctx: IndexingContext) -> Result<IndexingOutcome, ExecutionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match self.next_behavior() {
            Behavior::Succeed {
                steps,
                step_delay,
                outcome,
            } => {
                for step in steps {
                    ctx.checkpoint()?;
                    ctx.progress.report(step).await;
                    tokio::time::sleep(step_delay).await;
                }
                ctx.checkpoint()?;
                Ok(outcome)
            }
            Behavior::Fail(message) => Err(ExecutionError::Failed(message)),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::HangUntilCancelled => {
                ctx.cancel.cancelled().await;
                Err(ExecutionError::Cancelled)
            }
            Behavior::IgnoreCancel => {
                std::future::pending::<()>().await;
                Ok(IndexingOutcome::default())
            }
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(IndexingOutcome::default())
            }
        }
    }
}

/// Wraps a [`SqliteJobStore`]; the next `failures` calls to `get`, `put`
/// and `modify` fail with a transient store error.
pub struct FlakyStore {
    inner: SqliteJobStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: SqliteJobStore) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// The wrapped store, for reads that must not trip a failure.
    pub fn inner(&self) -> &SqliteJobStore {
        &self.inner
    }

    pub fn remaining_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<(), JobError> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(JobError::Store(DatabaseError::LockPoisoned))
        } else {
            Ok(())
        }
    }
}

impl JobStore for FlakyStore {
    fn put(&self, job: &IndexingJob) -> Result<(), JobError> {
        self.trip()?;
        self.inner.put(job)
    }

    fn get(&self, id: &str) -> Result<IndexingJob, JobError> {
        self.trip()?;
        self.inner.get(id)
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobSummary>, JobError> {
        self.inner.list(status, limit)
    }

    fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<IndexingJob>, JobError> {
        self.inner.list_for_workspace(workspace_id)
    }

    fn list_ids_by_status(&self, status: JobStatus) -> Result<Vec<String>, JobError> {
        self.inner.list_ids_by_status(status)
    }

    fn modify(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut IndexingJob) -> Result<(), JobError>,
    ) -> Result<IndexingJob, JobError> {
        self.trip()?;
        self.inner.modify(id, f)
    }

    fn stats(
        &self,
        window_start: DateTime<Utc>,
        window_hours: u32,
    ) -> Result<IndexingStats, JobError> {
        self.inner.stats(window_start, window_hours)
    }
}
