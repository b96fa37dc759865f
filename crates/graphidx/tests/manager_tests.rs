//! Validation, permissions, queries and statistics of the indexing manager.

mod common;

use std::time::Duration;

use common::{Behavior, TestHarness};
use graphidx::api::{action_response, ApiResponse};
use graphidx::{
    Caller, CreateJobRequest, IndexingJob, JobError, JobStatus, JobStore, WorkspaceDirectory,
};

/// Drives a job straight to `status` through the store, bypassing any runner.
fn settle(harness: &TestHarness, job: &IndexingJob, status: JobStatus) {
    harness
        .store
        .modify(&job.id, &mut |j: &mut IndexingJob| match status {
            JobStatus::Queued => Ok(()),
            JobStatus::Running => j.claim(),
            JobStatus::Completed => {
                j.claim()?;
                j.complete(Default::default())
            }
            JobStatus::Failed => {
                j.claim()?;
                j.fail("boom")
            }
            JobStatus::Cancelled => j.cancel(),
        })
        .unwrap();
    if status.is_terminal() {
        harness
            .workspaces
            .release_indexing(&job.workspace_id, &job.id)
            .unwrap();
    }
}

#[tokio::test]
async fn test_create_requires_write_permission() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let reader = Caller::new("viewer", ["indexing:read"]);

    let err = harness
        .manager
        .create_job(&reader, CreateJobRequest::new(&ws.id))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::PermissionDenied(_)));
    assert!(harness.manager.list_jobs(None, None).await.unwrap().is_empty());
    assert!(!harness.reload_workspace(&ws.id).is_indexing());
}

#[tokio::test]
async fn test_cancel_and_retry_require_write_permission() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;
    let reader = Caller::new("viewer", Vec::<String>::new());

    assert!(matches!(
        harness.manager.cancel_job(&reader, &job.id).await,
        Err(JobError::PermissionDenied(_))
    ));
    assert!(matches!(
        harness.manager.retry_job(&reader, &job.id).await,
        Err(JobError::PermissionDenied(_))
    ));
    assert_eq!(harness.job(&job.id).await.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_create_rejects_invalid_requests() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");

    let err = harness
        .manager
        .create_job(&harness.caller, CreateJobRequest::new("  "))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));

    let mut request = CreateJobRequest::new(&ws.id);
    request.config.chunk_overlap = request.config.chunk_size;
    let err = harness
        .manager
        .create_job(&harness.caller, request)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));

    let err = harness
        .manager
        .create_job(&harness.caller, CreateJobRequest::new("no-such-workspace"))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::NotFound { kind: "Workspace", .. }));

    // Nothing was created and the workspace is untouched.
    assert!(harness.manager.list_jobs(None, None).await.unwrap().is_empty());
    assert!(!harness.reload_workspace(&ws.id).is_indexing());
}

#[tokio::test]
async fn test_second_job_for_busy_workspace_is_rejected() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let first = harness.create(&ws).await;

    let err = harness
        .manager
        .create_job(&harness.caller, CreateJobRequest::new(&ws.id))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidState(_)));
    assert_eq!(harness.manager.list_jobs(None, None).await.unwrap().len(), 1);

    // Once the first job is over the workspace accepts a new one.
    settle(&harness, &first, JobStatus::Completed);
    let second = harness.create(&ws).await;
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn test_get_missing_job_is_not_found() {
    let harness = TestHarness::new(Behavior::succeed());
    let caller = harness.caller.clone();

    assert!(matches!(
        harness.manager.get_job("missing").await,
        Err(JobError::NotFound { kind: "Job", .. })
    ));
    assert!(matches!(
        harness.manager.cancel_job(&caller, "missing").await,
        Err(JobError::NotFound { .. })
    ));
    assert!(matches!(
        harness.manager.retry_job(&caller, "missing").await,
        Err(JobError::NotFound { .. })
    ));
    assert!(matches!(
        harness.manager.can_retry("missing").await,
        Err(JobError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_list_jobs_limit_and_order() {
    let harness = TestHarness::new(Behavior::succeed());
    let mut created = Vec::new();
    for i in 0..5 {
        let ws = harness.workspace(&format!("corpus-{}", i));
        created.push(harness.create(&ws).await);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let listed = harness.manager.list_jobs(None, Some(2)).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, created[4].id);
    assert_eq!(listed[1].id, created[3].id);

    let all = harness.manager.list_jobs(None, None).await.unwrap();
    assert_eq!(all.len(), 5);
    assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
}

#[tokio::test]
async fn test_list_jobs_by_status() {
    let harness = TestHarness::new(Behavior::succeed());
    let mut jobs = Vec::new();
    for i in 0..4 {
        let ws = harness.workspace(&format!("corpus-{}", i));
        jobs.push(harness.create(&ws).await);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    settle(&harness, &jobs[0], JobStatus::Failed);
    settle(&harness, &jobs[2], JobStatus::Failed);
    settle(&harness, &jobs[3], JobStatus::Completed);

    let failed = harness
        .manager
        .list_jobs(Some(JobStatus::Failed), None)
        .await
        .unwrap();
    let ids: Vec<_> = failed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![jobs[2].id.as_str(), jobs[0].id.as_str()]);
    assert!(failed.iter().all(|s| s.status == JobStatus::Failed));

    let queued = harness
        .manager
        .list_jobs(Some(JobStatus::Queued), None)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, jobs[1].id);

    assert!(harness
        .manager
        .list_jobs(Some(JobStatus::Running), None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_jobs_for_workspace() {
    let harness = TestHarness::new(Behavior::succeed());
    let papers = harness.workspace("papers");
    let letters = harness.workspace("letters");

    let first = harness.create(&papers).await;
    settle(&harness, &first, JobStatus::Failed);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = harness.create(&papers).await;
    harness.create(&letters).await;

    let jobs = harness
        .manager
        .get_jobs_for_workspace(&papers.id)
        .await
        .unwrap();
    let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

    assert!(matches!(
        harness.manager.get_jobs_for_workspace("nope").await,
        Err(JobError::NotFound { kind: "Workspace", .. })
    ));
}

#[tokio::test]
async fn test_indexing_stats() {
    let harness = TestHarness::new(Behavior::succeed());
    let mut jobs = Vec::new();
    for i in 0..5 {
        let ws = harness.workspace(&format!("corpus-{}", i));
        jobs.push(harness.create(&ws).await);
    }
    settle(&harness, &jobs[0], JobStatus::Completed);
    settle(&harness, &jobs[1], JobStatus::Completed);
    settle(&harness, &jobs[2], JobStatus::Completed);
    settle(&harness, &jobs[3], JobStatus::Failed);
    settle(&harness, &jobs[4], JobStatus::Cancelled);

    let stats = harness.manager.get_indexing_stats().await.unwrap();
    assert_eq!(stats.total_jobs, 5);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.success_rate, Some(0.75));
    assert!(stats.average_completion_secs.unwrap() >= 0.0);
    assert_eq!(stats.recent.window_hours, 24);
    assert_eq!(stats.recent.created, 5);
    assert_eq!(stats.recent.completed, 3);
    assert_eq!(stats.recent.failed, 1);
    assert_eq!(stats.recent.cancelled, 1);
}

#[tokio::test]
async fn test_stats_on_empty_store() {
    let harness = TestHarness::new(Behavior::succeed());
    let stats = harness.manager.get_indexing_stats().await.unwrap();
    assert_eq!(stats.total_jobs, 0);
    assert_eq!(stats.success_rate, None);
    assert_eq!(stats.average_completion_secs, None);
}

#[tokio::test]
async fn test_transient_store_errors_are_retried() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;

    harness.store.fail_next(2);
    let fetched = harness.manager.get_job(&job.id).await.unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(harness.store.remaining_failures(), 0);
}

#[tokio::test]
async fn test_persistent_store_errors_surface() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;

    harness.store.fail_next(10);
    let err = harness.manager.get_job(&job.id).await.unwrap_err();
    assert!(err.is_transient());

    let response = ApiResponse::<IndexingJob>::from_result(Err(err));
    assert!(!response.success);
    assert_eq!(response.status, 500);
    assert_eq!(response.error.as_deref(), Some("Internal error"));
}

#[tokio::test]
async fn test_create_failure_releases_workspace() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");

    harness.store.fail_next(10);
    let err = harness
        .manager
        .create_job(&harness.caller, CreateJobRequest::new(&ws.id))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(!harness.reload_workspace(&ws.id).is_indexing());
}

#[tokio::test]
async fn test_action_responses() {
    let harness = TestHarness::new(Behavior::succeed());
    let ws = harness.workspace("papers");
    let job = harness.create(&ws).await;

    let cancelled = action_response(
        &job.id,
        "cancel",
        harness.manager.cancel_job(&harness.caller, &job.id).await,
        "job already finished",
    );
    assert!(cancelled.success);
    assert_eq!(cancelled.data.unwrap().action, "cancel");

    let again = action_response(
        &job.id,
        "cancel",
        harness.manager.cancel_job(&harness.caller, &job.id).await,
        "job already finished",
    );
    assert!(!again.success);
    assert_eq!(again.status, 400);
    assert_eq!(again.error.as_deref(), Some("job already finished"));
}
