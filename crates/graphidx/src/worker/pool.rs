//! Job scheduler: dispatches queued jobs onto a bounded set of concurrent
//! executions and tracks the cancellation token of each one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{JobEventBroadcaster, JobEventKind};
use crate::error::JobError;
use crate::indexer::IndexingOperation;
use crate::job::{IndexingJob, JobStatus, JobStore, StoreRetry};
use crate::workspace::WorkspaceDirectory;

use super::runner::{self, INTERRUPTED_MESSAGE, LEASE_EXPIRED_MESSAGE};

/// Tunables for [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    /// How long a cancelled or timed-out operation gets to stop on its own.
    pub cancel_grace: Duration,
    /// Interval of the sweep that picks up QUEUED jobs nobody signalled.
    /// Runners renew their lease on the same interval.
    pub poll_interval: Duration,
    /// How long a claim stays valid without renewal. Other schedulers
    /// recover a RUNNING job only after its lease lapsed.
    pub lease_ttl: Duration,
    pub store_retry: StoreRetry,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            store_retry: StoreRetry::default(),
        }
    }
}

impl SchedulerSettings {
    pub(crate) fn lease_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the scheduler handle, its dispatch loop and runners.
pub(crate) struct Shared {
    /// Written as the lease owner of every job claimed here.
    pub(crate) instance_id: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) workspaces: Arc<dyn WorkspaceDirectory>,
    pub(crate) operation: Arc<dyn IndexingOperation>,
    pub(crate) events: JobEventBroadcaster,
    pub(crate) settings: SchedulerSettings,
    /// Cancellation tokens of jobs that a runner currently owns.
    running: Mutex<HashMap<String, CancellationToken>>,
    /// Jobs handed to a runner task (waiting for a slot or executing).
    dispatched: Mutex<HashSet<String>>,
    slots: Arc<Semaphore>,
    pub(crate) shutdown: CancellationToken,
    signal: mpsc::UnboundedSender<String>,
}

impl Shared {
    pub(crate) fn register(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        lock(&self.running).insert(id.to_string(), token.clone());
        token
    }

    pub(crate) fn unregister(&self, id: &str) {
        lock(&self.running).remove(id);
    }

    fn runs_here(&self, id: &str) -> bool {
        lock(&self.running).contains_key(id)
    }

    fn forget(&self, id: &str) {
        lock(&self.dispatched).remove(id);
    }

    fn signal(&self, id: &str) {
        // Only fails once the dispatch loop has exited.
        let _ = self.signal.send(id.to_string());
    }
}

/// Owns the dispatch loop.
///
/// Jobs reach the loop either through [`Scheduler::enqueue`] or through the
/// periodic sweep of QUEUED jobs in the store. A job id is handed to at most
/// one runner task inside this process; across processes the atomic claim
/// in the store decides, and the lease it records keeps other schedulers
/// from recovering a job that is still being worked on.
pub struct Scheduler {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        workspaces: Arc<dyn WorkspaceDirectory>,
        operation: Arc<dyn IndexingOperation>,
        events: JobEventBroadcaster,
        settings: SchedulerSettings,
    ) -> Self {
        let (signal, receiver) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            shared: Arc::new(Shared {
                instance_id: uuid::Uuid::new_v4().to_string(),
                store,
                workspaces,
                operation,
                events,
                settings,
                running: Mutex::new(HashMap::new()),
                dispatched: Mutex::new(HashSet::new()),
                slots,
                shutdown: CancellationToken::new(),
                signal,
            }),
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    /// Lease owner recorded on jobs this scheduler claims.
    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Recovers jobs left RUNNING by a scheduler that stopped renewing its
    /// lease and starts the dispatch loop. Returns the number of recovered
    /// jobs.
    ///
    /// Calling it again once started is a no-op.
    pub async fn start(&self) -> Result<usize, JobError> {
        let Some(receiver) = lock(&self.receiver).take() else {
            return Ok(0);
        };

        let recovered = recover_abandoned(&self.shared, INTERRUPTED_MESSAGE).await?;

        let queued = self
            .shared
            .settings
            .store_retry
            .run("list queued jobs", || {
                self.shared.store.list_ids_by_status(JobStatus::Queued)
            })
            .await?;
        for id in &queued {
            self.shared.signal(id);
        }

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(dispatch_loop(shared, receiver));
        *lock(&self.dispatcher) = Some(handle);

        info!(
            max_concurrent_jobs = self.shared.settings.max_concurrent_jobs,
            recovered,
            queued = queued.len(),
            "Scheduler started"
        );
        Ok(recovered)
    }

    /// Asks the dispatch loop to pick up job `id`.
    pub fn enqueue(&self, id: &str) {
        self.shared.signal(id);
    }

    /// Fires the cancellation token of job `id` if it is executing here.
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.shared.running).get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a runner in this process currently owns job `id`.
    pub fn is_active(&self, id: &str) -> bool {
        lock(&self.shared.running).contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.shared.running).len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stops dispatching, interrupts running jobs and waits for their runners.
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler...");
        self.shared.shutdown.cancel();
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch loop panicked");
            }
        }
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Fails RUNNING jobs whose lease lapsed and that no runner here owns, and
/// releases their workspaces.
async fn recover_abandoned(shared: &Shared, message: &str) -> Result<usize, JobError> {
    let running = shared
        .settings
        .store_retry
        .run("list running jobs", || {
            shared.store.list_ids_by_status(JobStatus::Running)
        })
        .await?;

    let mut recovered = 0;
    for id in running {
        if shared.runs_here(&id) {
            continue;
        }
        let now = crate::job::record::now();
        match shared.store.get(&id) {
            Ok(job) if job.lease_expired(now) => {}
            Ok(_) | Err(JobError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }

        let result = shared
            .settings
            .store_retry
            .run("recover job", || {
                shared.store.modify(&id, &mut |job: &mut IndexingJob| {
                    if !job.lease_expired(now) {
                        return Err(JobError::InvalidState(format!(
                            "job {} was renewed by {}",
                            job.id,
                            job.lease_owner.as_deref().unwrap_or("nobody")
                        )));
                    }
                    job.fail(message)
                })
            })
            .await;
        match result {
            Ok(job) => {
                if let Err(e) = shared.workspaces.release_indexing(&job.workspace_id, &job.id) {
                    warn!(job_id = %id, error = %e, "Failed to release workspace of recovered job");
                }
                shared.events.publish(JobEventKind::Failed, &job);
                warn!(job_id = %id, reason = message, "Marked abandoned job as failed");
                recovered += 1;
            }
            // Renewed, finished or removed in the meantime.
            Err(JobError::InvalidState(_)) | Err(JobError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(recovered)
}

async fn dispatch_loop(shared: Arc<Shared>, mut receiver: mpsc::UnboundedReceiver<String>) {
    let mut tasks = JoinSet::new();
    let mut sweep = tokio::time::interval(shared.settings.poll_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            Some(id) = receiver.recv() => dispatch(&shared, &mut tasks, id),
            _ = sweep.tick() => {
                if let Err(e) = recover_abandoned(&shared, LEASE_EXPIRED_MESSAGE).await {
                    warn!(error = %e, "Sweep for abandoned jobs failed");
                }
                match shared.store.list_ids_by_status(JobStatus::Queued) {
                    Ok(ids) => {
                        for id in ids {
                            dispatch(&shared, &mut tasks, id);
                        }
                    }
                    Err(e) => warn!(error = %e, "Sweep for queued jobs failed"),
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Job runner task failed");
                }
            }
        }
    }

    debug!(pending = tasks.len(), "Dispatch loop stopping");
    for token in lock(&shared.running).values() {
        token.cancel();
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Job runner task failed during shutdown");
        }
    }
}

fn dispatch(shared: &Arc<Shared>, tasks: &mut JoinSet<()>, id: String) {
    if !lock(&shared.dispatched).insert(id.clone()) {
        return;
    }
    let shared = Arc::clone(shared);
    tasks.spawn(async move {
        take_slot_and_run(&shared, &id).await;
        shared.forget(&id);
        // A retry may have re-queued the job while this runner was finishing.
        if let Ok(job) = shared.store.get(&id) {
            if job.status == JobStatus::Queued && !shared.shutdown.is_cancelled() {
                shared.signal(&id);
            }
        }
    });
}

async fn take_slot_and_run(shared: &Arc<Shared>, id: &str) {
    let permit = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        permit = Arc::clone(&shared.slots).acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        return;
    };
    runner::execute(shared, id).await;
}
