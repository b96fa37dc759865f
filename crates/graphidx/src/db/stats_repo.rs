//! Job statistics: SQL aggregation over `indexing_jobs`.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{format_timestamp, Database, DatabaseError};
use crate::job::JobStatus;

/// Aggregate view of every job the store knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexingStats {
    pub total_jobs: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// completed / (completed + failed), all time. `None` before any job has
    /// completed or failed.
    pub success_rate: Option<f64>,
    /// Mean of `completed_at - started_at` over completed jobs, in seconds.
    pub average_completion_secs: Option<f64>,
    pub recent: RecentActivity,
}

/// Activity inside the trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecentActivity {
    pub window_hours: u32,
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Computes statistics. The recent counters cover jobs created (or finished)
/// at or after `window_start`.
pub fn summary(
    db: &Database,
    window_start: DateTime<Utc>,
    window_hours: u32,
) -> Result<IndexingStats, DatabaseError> {
    let since = format_timestamp(window_start);
    let counts = super::job_repo::count_by_status(db)?;

    let mut stats = IndexingStats::default();
    for (status, count) in counts {
        stats.total_jobs += count;
        match status {
            JobStatus::Queued => stats.queued = count,
            JobStatus::Running => stats.running = count,
            JobStatus::Completed => stats.completed = count,
            JobStatus::Failed => stats.failed = count,
            JobStatus::Cancelled => stats.cancelled = count,
        }
    }

    let finished = stats.completed + stats.failed;
    if finished > 0 {
        stats.success_rate = Some(stats.completed as f64 / finished as f64);
    }

    db.with_conn(|conn| {
        stats.average_completion_secs = conn.query_row(
            "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400.0)
             FROM indexing_jobs
             WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
            [],
            |r| r.get::<_, Option<f64>>(0),
        )?;

        let (created, completed, failed, cancelled): (i64, i64, i64, i64) = conn.query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN created_at >= ?1 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'completed' AND completed_at >= ?1 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'failed' AND completed_at >= ?1 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'cancelled' AND completed_at >= ?1 THEN 1 ELSE 0 END), 0)
             FROM indexing_jobs",
            params![since],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;

        stats.recent = RecentActivity {
            window_hours,
            created: created.max(0) as u64,
            completed: completed.max(0) as u64,
            failed: failed.max(0) as u64,
            cancelled: cancelled.max(0) as u64,
        };
        Ok(())
    })?;

    Ok(stats)
}
