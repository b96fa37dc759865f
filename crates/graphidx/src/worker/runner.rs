//! Execution of one claimed job: claim, run the indexing operation under a
//! timeout and a cancellation token, fold its progress into the store, and
//! record how it ended.
//!
//! The claim leases the job to this scheduler instance. The lease is renewed
//! on every watch tick; the terminal write only lands while it is still held.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::pool::Shared;
use crate::broadcast::JobEventKind;
use crate::error::JobError;
use crate::indexer::{ExecutionError, IndexingContext, IndexingOutcome, ProgressReporter};
use crate::job::{IndexingJob, IndexingResult, JobStatus, ProgressUpdate};

/// Error recorded on jobs found RUNNING when the scheduler starts.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: scheduler restarted";

/// Error recorded on jobs whose owner stopped renewing its lease while
/// another scheduler was running.
pub const LEASE_EXPIRED_MESSAGE: &str = "interrupted: scheduler lease expired";

/// Error recorded on jobs still running when the scheduler shuts down.
pub const SHUTDOWN_MESSAGE: &str = "interrupted: scheduler shutting down";

const PROGRESS_BUFFER: usize = 32;

/// How an execution ended, before it is written to the store.
#[derive(Debug)]
enum RunEnd {
    Finished(Result<IndexingOutcome, ExecutionError>),
    Cancelled,
    TimedOut,
    Shutdown,
    /// Another scheduler recovered the job after the lease lapsed.
    LeaseLost,
}

pub(crate) async fn execute(shared: &Arc<Shared>, id: &str) {
    let span = info_span!("indexing_job", job_id = %id);
    async {
        // Registered before claiming so a cancel that lands right after the
        // claim still finds the token.
        let token = shared.register(id);
        if let Some(job) = claim(shared, id).await {
            run_claimed(shared, job, token).await;
        }
        shared.unregister(id);
    }
    .instrument(span)
    .await
}

async fn claim(shared: &Shared, id: &str) -> Option<IndexingJob> {
    let owner = shared.instance_id.as_str();
    let ttl = shared.settings.lease_window();
    let result = shared
        .settings
        .store_retry
        .run("claim job", || {
            shared.store.modify(id, &mut |job: &mut IndexingJob| {
                job.claim()?;
                job.take_lease(owner, ttl)
            })
        })
        .await;
    match result {
        Ok(job) => Some(job),
        Err(JobError::InvalidState(reason)) => {
            debug!(%reason, "Claim declined");
            None
        }
        Err(JobError::NotFound { .. }) => {
            warn!("Job vanished before it could be claimed");
            None
        }
        Err(e) => {
            error!(error = %e, "Failed to claim job");
            None
        }
    }
}

async fn run_claimed(shared: &Arc<Shared>, job: IndexingJob, token: CancellationToken) {
    info!(workspace_id = %job.workspace_id, attempt = job.retry_count + 1, "Indexing started");
    shared.events.publish(JobEventKind::Started, &job);

    let workspace = match shared.workspaces.get_workspace(&job.workspace_id) {
        Ok(Some(ws)) => ws,
        Ok(None) => {
            let err = ExecutionError::Failed(format!("workspace {} not found", job.workspace_id));
            finish(shared, &job, Instant::now(), RunEnd::Finished(Err(err))).await;
            return;
        }
        Err(e) => {
            let err = ExecutionError::Failed(format!("workspace lookup failed: {}", e));
            finish(shared, &job, Instant::now(), RunEnd::Finished(Err(err))).await;
            return;
        }
    };

    match shared.workspaces.mark_indexing(&workspace.id, &job.id) {
        Ok(true) => {}
        Ok(false) => {
            let err = ExecutionError::Failed(format!(
                "workspace {} is being indexed by another job",
                workspace.id
            ));
            finish(shared, &job, Instant::now(), RunEnd::Finished(Err(err))).await;
            return;
        }
        Err(e) => {
            let err = ExecutionError::Failed(format!("failed to mark workspace: {}", e));
            finish(shared, &job, Instant::now(), RunEnd::Finished(Err(err))).await;
            return;
        }
    }

    let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_BUFFER);
    let ctx = IndexingContext {
        job_id: job.id.clone(),
        workspace_id: job.workspace_id.clone(),
        data_path: workspace.data_path.clone(),
        config: job.config.clone(),
        progress: ProgressReporter::new(progress_tx, token.clone()),
        cancel: token.clone(),
    };

    let started = Instant::now();
    let operation = Arc::clone(&shared.operation);
    let mut handle: JoinHandle<Result<IndexingOutcome, ExecutionError>> =
        tokio::spawn(async move { operation.run(ctx).await }.in_current_span());

    let deadline = tokio::time::sleep(shared.settings.job_timeout);
    tokio::pin!(deadline);

    // Renews the lease and catches cancellations written by another process.
    let mut watch = tokio::time::interval(shared.settings.poll_interval);
    watch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    watch.tick().await;

    let end = loop {
        tokio::select! {
            biased;
            // Shutdown also fires every token; it must win over them.
            _ = shared.shutdown.cancelled() => break RunEnd::Shutdown,
            _ = token.cancelled() => break RunEnd::Cancelled,
            _ = &mut deadline => break RunEnd::TimedOut,
            Some(update) = progress_rx.recv() => {
                if !record_progress(shared, &job.id, &update).await {
                    break RunEnd::Cancelled;
                }
            }
            _ = watch.tick() => match renew_lease(shared, &job.id).await {
                Lease::Held => {}
                Lease::Released => break RunEnd::Cancelled,
                Lease::Lost => break RunEnd::LeaseLost,
            },
            joined = &mut handle => break RunEnd::Finished(joined_outcome(joined)),
        }
    };

    let end = match end {
        RunEnd::Finished(outcome) => {
            // Snapshots sent just before the operation returned.
            while let Ok(update) = progress_rx.try_recv() {
                if !record_progress(shared, &job.id, &update).await {
                    break;
                }
            }
            RunEnd::Finished(outcome)
        }
        interrupted => {
            token.cancel();
            stop_within_grace(handle, shared.settings.cancel_grace).await;
            interrupted
        }
    };
    drop(progress_rx);

    finish(shared, &job, started, end).await;
}

fn joined_outcome(
    joined: Result<Result<IndexingOutcome, ExecutionError>, JoinError>,
) -> Result<IndexingOutcome, ExecutionError> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(ExecutionError::Panicked(panic_message(e))),
        Err(_) => Err(ExecutionError::Cancelled),
    }
}

fn panic_message(e: JoinError) -> String {
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Gives a signalled operation `grace` to return, then aborts it. Aborting
/// drops the operation's future and with it everything it holds.
async fn stop_within_grace(
    mut handle: JoinHandle<Result<IndexingOutcome, ExecutionError>>,
    grace: Duration,
) {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(_) => debug!("Operation stopped after cancellation"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "Operation ignored cancellation, aborting");
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Returns `false` once the job is no longer RUNNING.
async fn record_progress(shared: &Shared, id: &str, update: &ProgressUpdate) -> bool {
    let result = shared
        .settings
        .store_retry
        .run("record progress", || {
            shared
                .store
                .modify(id, &mut |job: &mut IndexingJob| job.apply_progress(update))
        })
        .await;
    match result {
        Ok(job) => {
            debug!(
                stage = %update.stage,
                progress = job.progress_percentage,
                "Progress"
            );
            shared.events.publish(JobEventKind::Progress, &job);
            true
        }
        Err(JobError::InvalidState(_)) => false,
        Err(e) => {
            warn!(error = %e, "Failed to record progress");
            true
        }
    }
}

enum Lease {
    Held,
    /// The job left RUNNING, e.g. cancelled by another process.
    Released,
    /// Still RUNNING, but no longer ours.
    Lost,
}

async fn renew_lease(shared: &Shared, id: &str) -> Lease {
    let owner = shared.instance_id.as_str();
    let ttl = shared.settings.lease_window();
    let result = shared
        .settings
        .store_retry
        .run("renew lease", || {
            shared
                .store
                .modify(id, &mut |job: &mut IndexingJob| job.renew_lease(owner, ttl))
        })
        .await;
    match result {
        Ok(_) => Lease::Held,
        Err(JobError::NotFound { .. }) => Lease::Released,
        Err(JobError::InvalidState(_)) => match shared.store.get(id) {
            Ok(job) if job.status == JobStatus::Running => Lease::Lost,
            _ => Lease::Released,
        },
        Err(e) => {
            // The next tick tries again.
            debug!(error = %e, "Lease renewal failed");
            Lease::Held
        }
    }
}

/// Terminal transition derived from a [`RunEnd`].
enum Terminal {
    Complete(IndexingResult),
    Cancel,
    Fail(String),
    /// Nothing to write; the new owner records the outcome.
    Abandon,
}

impl Terminal {
    fn from_end(end: RunEnd, elapsed: Duration, timeout: Duration) -> Self {
        match end {
            RunEnd::Finished(Ok(outcome)) => Terminal::Complete(outcome.into_result(elapsed)),
            RunEnd::Finished(Err(ExecutionError::Cancelled)) | RunEnd::Cancelled => {
                Terminal::Cancel
            }
            RunEnd::Finished(Err(e)) => Terminal::Fail(e.to_string()),
            RunEnd::TimedOut => Terminal::Fail(ExecutionError::TimedOut(timeout).to_string()),
            RunEnd::Shutdown => Terminal::Fail(SHUTDOWN_MESSAGE.to_string()),
            RunEnd::LeaseLost => Terminal::Abandon,
        }
    }

    fn apply(&self, owner: &str, job: &mut IndexingJob) -> Result<(), JobError> {
        job.require_owner(owner)?;
        match self {
            Terminal::Abandon => Err(JobError::InvalidState(format!(
                "job {} was taken over",
                job.id
            ))),
            Terminal::Complete(result) => job.complete(result.clone()),
            Terminal::Cancel => job.cancel(),
            Terminal::Fail(message) => job.fail(message),
        }
    }

    fn event(&self) -> JobEventKind {
        match self {
            Terminal::Complete(_) => JobEventKind::Completed,
            Terminal::Cancel => JobEventKind::Cancelled,
            Terminal::Fail(_) | Terminal::Abandon => JobEventKind::Failed,
        }
    }
}

/// Releases the workspace and writes the terminal state.
///
/// The workspace is released first: once the job reads as terminal it may be
/// retried, and the retry takes the hold again under the same job id.
async fn finish(shared: &Shared, job: &IndexingJob, started: Instant, end: RunEnd) {
    let elapsed = started.elapsed();
    let terminal = Terminal::from_end(end, elapsed, shared.settings.job_timeout);
    if matches!(terminal, Terminal::Abandon) {
        warn!("Lease taken over by another scheduler, dropping outcome");
        return;
    }

    if let Err(e) = shared
        .workspaces
        .release_indexing(&job.workspace_id, &job.id)
    {
        warn!(error = %e, "Failed to release workspace");
    }

    let result = match shared
        .settings
        .store_retry
        .run("finish job", || write_terminal(shared, &job.id, &terminal))
        .await
    {
        Err(e) if e.is_transient() => keep_finishing(shared, job, &terminal, e).await,
        other => other,
    };

    match result {
        Ok(stored) => {
            match &terminal {
                Terminal::Complete(_) => info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    entities = stored.entities_extracted,
                    relationships = stored.relationships_extracted,
                    "Indexing completed"
                ),
                Terminal::Cancel => info!("Indexing cancelled"),
                Terminal::Fail(message) => warn!(error = %message, "Indexing failed"),
                Terminal::Abandon => {}
            }
            shared.events.publish(terminal.event(), &stored);
        }
        Err(JobError::InvalidState(reason)) => {
            debug!(%reason, "Job already left RUNNING, skipping terminal write");
        }
        Err(e) => error!(
            error = %e,
            "Failed to record job outcome, leaving it to lease recovery"
        ),
    }
}

fn write_terminal(shared: &Shared, id: &str, terminal: &Terminal) -> Result<IndexingJob, JobError> {
    let owner = shared.instance_id.as_str();
    shared
        .store
        .modify(id, &mut |j: &mut IndexingJob| terminal.apply(owner, j))
}

/// The terminal write ran out of retries. Holds the workspace again and
/// retries every poll interval until the write lands or the scheduler shuts
/// down. The runner stays registered meanwhile, so the job still reads as
/// active here and the sweep leaves it alone.
async fn keep_finishing(
    shared: &Shared,
    job: &IndexingJob,
    terminal: &Terminal,
    mut last: JobError,
) -> Result<IndexingJob, JobError> {
    error!(error = %last, "Failed to record job outcome, retrying until the store recovers");
    match shared.workspaces.mark_indexing(&job.workspace_id, &job.id) {
        Ok(true) => {}
        Ok(false) => warn!("Workspace was taken by another job meanwhile"),
        Err(e) => warn!(error = %e, "Failed to hold workspace again"),
    }

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return Err(last),
            _ = tokio::time::sleep(shared.settings.poll_interval) => {}
        }

        let result = match write_terminal(shared, &job.id, terminal) {
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Terminal write still failing");
                last = e;
                continue;
            }
            other => other,
        };
        if let Err(e) = shared
            .workspaces
            .release_indexing(&job.workspace_id, &job.id)
        {
            warn!(error = %e, "Failed to release workspace");
        }
        return result;
    }
}
