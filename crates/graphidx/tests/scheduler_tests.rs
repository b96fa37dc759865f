//! Concurrency, recovery and shutdown behaviour of the scheduler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_settings, Behavior, ScriptedIndexer, TestHarness};
use graphidx::worker::{INTERRUPTED_MESSAGE, LEASE_EXPIRED_MESSAGE};
use graphidx::{
    IndexingConfig, IndexingJob, IndexingOutcome, JobError, JobStatus, JobStore,
    ProgressUpdate, WorkspaceDirectory, WorkspaceStatus,
};

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let mut settings = fast_settings();
    settings.max_concurrent_jobs = 2;
    let harness = TestHarness::with_indexer(
        ScriptedIndexer::new(Behavior::Sleep(Duration::from_millis(120))),
        settings,
    );
    harness.start().await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let ws = harness.workspace(&format!("corpus-{}", i));
        ids.push(harness.create(&ws).await.id);
    }
    for id in &ids {
        harness.wait_for_status(id, JobStatus::Completed).await;
    }

    assert_eq!(harness.indexer.runs(), 5);
    assert!(harness.indexer.peak() <= 2, "peak was {}", harness.indexer.peak());
    assert_eq!(harness.indexer.peak(), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_single_slot_runs_jobs_one_at_a_time() {
    let mut settings = fast_settings();
    settings.max_concurrent_jobs = 1;
    let harness = TestHarness::with_indexer(
        ScriptedIndexer::new(Behavior::Sleep(Duration::from_millis(40))),
        settings,
    );
    harness.start().await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let ws = harness.workspace(&format!("corpus-{}", i));
        ids.push(harness.create(&ws).await.id);
    }
    for id in &ids {
        harness.wait_for_status(id, JobStatus::Completed).await;
    }
    assert_eq!(harness.indexer.peak(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;

    let store = Arc::clone(&harness.store);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let id = job.id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            store.modify(&id, &mut |j: &mut IndexingJob| j.claim())
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(claimed) => {
                assert_eq!(claimed.status, JobStatus::Running);
                winners += 1;
            }
            Err(JobError::InvalidState(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(harness.job(&job.id).await.status, JobStatus::Running);
}

#[tokio::test]
async fn test_start_recovers_interrupted_jobs() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;

    // A runner of a previous process claimed the job and died.
    harness
        .store
        .modify(&job.id, &mut |j: &mut IndexingJob| j.claim())
        .unwrap();

    let recovered = harness.manager.start().await.unwrap();
    assert_eq!(recovered, 1);

    let failed = harness.job(&job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert_eq!(harness.reload_workspace(&ws.id).status, WorkspaceStatus::Ready);

    assert!(harness
        .manager
        .retry_job(&harness.caller, &job.id)
        .await
        .unwrap());
    let done = harness.wait_for_status(&job.id, JobStatus::Completed).await;
    assert_eq!(done.retry_count, 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_start_twice_is_a_no_op() {
    let harness = TestHarness::new(Behavior::succeed());
    harness.start().await;
    assert_eq!(harness.manager.start().await.unwrap(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_queued_jobs_survive_restart() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;
    assert_eq!(harness.indexer.runs(), 0);

    let harness = harness
        .restart(ScriptedIndexer::new(Behavior::succeed()))
        .await;
    harness.start().await;

    harness.wait_for_status(&job.id, JobStatus::Completed).await;
    assert_eq!(harness.indexer.runs(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_running_jobs() {
    let harness = TestHarness::new(Behavior::HangUntilCancelled);
    let ws = harness.workspace("papers");
    harness.start().await;

    let job = harness.create(&ws).await;
    harness.wait_for_status(&job.id, JobStatus::Running).await;

    harness.shutdown().await;

    let stopped = harness.job(&job.id).await;
    assert_eq!(stopped.status, JobStatus::Failed);
    assert!(stopped
        .error_message
        .unwrap_or_default()
        .contains("shutting down"));
    assert_eq!(harness.indexer.in_flight(), 0);
    assert_eq!(harness.reload_workspace(&ws.id).status, WorkspaceStatus::Ready);
    assert!(harness.manager.scheduler().is_shutdown());
}

#[tokio::test]
async fn test_cancel_written_elsewhere_stops_runner() {
    let harness = TestHarness::new(Behavior::HangUntilCancelled);
    let ws = harness.workspace("papers");
    harness.start().await;

    let job = harness.create(&ws).await;
    harness.wait_for_status(&job.id, JobStatus::Running).await;

    // Another process cancels through the shared store only.
    harness
        .store
        .modify(&job.id, &mut |j: &mut IndexingJob| j.cancel())
        .unwrap();

    harness.wait_idle().await;
    assert_eq!(harness.indexer.in_flight(), 0);
    assert_eq!(harness.job(&job.id).await.status, JobStatus::Cancelled);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_workspace_runner_fails_when_workspace_held_by_other_job() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;

    // Someone else grabbed the workspace in between.
    harness.workspaces.release_indexing(&ws.id, &job.id).unwrap();
    assert!(harness.workspaces.mark_indexing(&ws.id, "intruder").unwrap());

    harness.start().await;
    let failed = harness.wait_for_status(&job.id, JobStatus::Failed).await;
    assert!(failed
        .error_message
        .unwrap_or_default()
        .contains("another job"));
    assert_eq!(harness.indexer.runs(), 0);

    let ws = harness.reload_workspace(&ws.id);
    assert_eq!(ws.active_job_id.as_deref(), Some("intruder"));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_second_process_leaves_live_job_running() {
    let harness = TestHarness::new(Behavior::Sleep(Duration::from_millis(600)));
    let ws = harness.workspace("papers");
    harness.start().await;
    let job = harness.create(&ws).await;
    let running = harness.wait_for_status(&job.id, JobStatus::Running).await;
    assert_eq!(
        running.lease_owner.as_deref(),
        Some(harness.manager.scheduler().instance_id())
    );

    // e.g. `graphidx index` started while `serve` is busy.
    let other_indexer = Arc::new(ScriptedIndexer::new(Behavior::succeed()));
    let other = harness.peer(Arc::clone(&other_indexer));
    assert_eq!(other.start().await.unwrap(), 0);

    let done = harness.wait_for_status(&job.id, JobStatus::Completed).await;
    assert!(done.error_message.is_none());
    assert_eq!(done.retry_count, 0);
    assert!(done.lease_owner.is_none());
    assert_eq!(harness.indexer.runs(), 1);
    assert_eq!(other_indexer.runs(), 0);
    assert_eq!(harness.reload_workspace(&ws.id).status, WorkspaceStatus::Ready);

    other.shutdown().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_sweep_recovers_job_whose_lease_lapsed() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    harness.start().await;

    // Claimed by a scheduler that died without writing an outcome.
    let mut orphan = IndexingJob::new(&ws.id, IndexingConfig::default(), 3, None);
    orphan.claim().unwrap();
    orphan
        .take_lease("crashed-scheduler", chrono::Duration::milliseconds(300))
        .unwrap();
    harness.store.put(&orphan).unwrap();
    assert!(harness.workspaces.mark_indexing(&ws.id, &orphan.id).unwrap());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(harness.job(&orphan.id).await.status, JobStatus::Running);

    let failed = harness.wait_for_status(&orphan.id, JobStatus::Failed).await;
    assert_eq!(failed.error_message.as_deref(), Some(LEASE_EXPIRED_MESSAGE));
    assert!(failed.lease_owner.is_none());
    assert_eq!(harness.reload_workspace(&ws.id).status, WorkspaceStatus::Ready);
    assert_eq!(harness.indexer.runs(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_unrecorded_outcome_keeps_job_active_until_written() {
    let harness = TestHarness::new(Behavior::Sleep(Duration::from_millis(150)));
    let ws = harness.workspace("papers");
    harness.start().await;
    let job = harness.create(&ws).await;
    harness.wait_for_status(&job.id, JobStatus::Running).await;

    // The store goes away before the operation returns.
    harness.store.fail_next(usize::MAX);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while harness.indexer.in_flight() > 0 {
        assert!(std::time::Instant::now() < deadline, "operation never returned");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stuck = harness.store.inner().get(&job.id).unwrap();
    assert_eq!(stuck.status, JobStatus::Running);
    assert!(harness.manager.scheduler().is_active(&job.id));
    assert!(harness.reload_workspace(&ws.id).is_indexing());

    harness.store.fail_next(0);
    let done = harness.wait_for_status(&job.id, JobStatus::Completed).await;
    assert!(done.result.is_some());
    harness.wait_idle().await;
    assert_eq!(harness.reload_workspace(&ws.id).status, WorkspaceStatus::Ready);
    assert_eq!(harness.indexer.runs(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_progress_write_survives_transient_store_errors() {
    let mut settings = fast_settings();
    // Keeps lease renewals out of the way of the failures below.
    settings.poll_interval = Duration::from_secs(10);
    settings.lease_ttl = Duration::from_secs(60);
    let harness = TestHarness::with_indexer(
        ScriptedIndexer::new(Behavior::Succeed {
            steps: vec![
                ProgressUpdate::new("parsing", 10),
                ProgressUpdate::new("extracting", 40).with_counts(7, 30, 4),
            ],
            step_delay: Duration::from_millis(200),
            outcome: IndexingOutcome::default(),
        }),
        settings,
    );
    let ws = harness.workspace("papers");
    harness.start().await;
    let job = harness.create(&ws).await;
    harness
        .wait_until(&job.id, |j| j.stage.as_deref() == Some("parsing"))
        .await
        .unwrap_or_else(|j| panic!("first step never recorded: {:?}", j.stage));

    // Fewer than the retry attempts the harness allows. Polled through the
    // inner store so only the runner sees the failures.
    harness.store.fail_next(2);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let done = loop {
        let current = harness.store.inner().get(&job.id).unwrap();
        if current.status == JobStatus::Completed {
            break current;
        }
        assert!(std::time::Instant::now() < deadline, "job never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(harness.store.remaining_failures(), 0);
    assert_eq!(done.files_processed, 7);
    assert_eq!(done.entities_extracted, 30);
    assert_eq!(done.relationships_extracted, 4);
    harness.shutdown().await;
}
