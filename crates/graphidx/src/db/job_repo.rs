//! Job repository: persistence for the `indexing_jobs` table.
//!
//! Rows are stored as plain columns; `config` and `result` are JSON text.
//! `modify` is the only read-modify-write path and runs inside an
//! immediate transaction so no two writers interleave on one job.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::job::{IndexingJob, JobStatus, JobSummary};

const TABLE: &str = "indexing_jobs";

const COLUMNS: &str = "id, workspace_id, config, status, stage, progress_percentage, result,
    error_message, files_processed, entities_extracted, relationships_extracted,
    retry_count, max_retries, created_by, created_at, started_at, completed_at, updated_at,
    lease_owner, lease_expires_at";

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub workspace_id: String,
    pub config: String,
    pub status: String,
    pub stage: Option<String>,
    pub progress_percentage: i64,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub files_processed: i64,
    pub entities_extracted: i64,
    pub relationships_extracted: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_by: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            workspace_id: row.get("workspace_id")?,
            config: row.get("config")?,
            status: row.get("status")?,
            stage: row.get("stage")?,
            progress_percentage: row.get("progress_percentage")?,
            result: row.get("result")?,
            error_message: row.get("error_message")?,
            files_processed: row.get("files_processed")?,
            entities_extracted: row.get("entities_extracted")?,
            relationships_extracted: row.get("relationships_extracted")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            created_by: row.get("created_by")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at: row.get("lease_expires_at")?,
        })
    }

    pub fn from_job(job: &IndexingJob) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: job.id.clone(),
            workspace_id: job.workspace_id.clone(),
            config: serde_json::to_string(&job.config)?,
            status: job.status.as_str().to_string(),
            stage: job.stage.clone(),
            progress_percentage: i64::from(job.progress_percentage),
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            error_message: job.error_message.clone(),
            files_processed: to_i64(job.files_processed),
            entities_extracted: to_i64(job.entities_extracted),
            relationships_extracted: to_i64(job.relationships_extracted),
            retry_count: i64::from(job.retry_count),
            max_retries: i64::from(job.max_retries),
            created_by: job.created_by.clone(),
            created_at: format_timestamp(job.created_at),
            started_at: job.started_at.map(format_timestamp),
            completed_at: job.completed_at.map(format_timestamp),
            updated_at: format_timestamp(job.updated_at),
            lease_owner: job.lease_owner.clone(),
            lease_expires_at: job.lease_expires_at.map(format_timestamp),
        })
    }

    pub fn into_job(self) -> Result<IndexingJob, DatabaseError> {
        let id = self.id;
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            table: TABLE,
            id: id.clone(),
            reason,
        };

        let status: JobStatus = self
            .status
            .parse()
            .map_err(|_| corrupt(format!("unknown status '{}'", self.status)))?;
        let config = serde_json::from_str(&self.config)
            .map_err(|e| corrupt(format!("bad config: {}", e)))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("bad result: {}", e)))?;

        let created_at = parse_timestamp(TABLE, &id, &self.created_at)?;
        let updated_at = parse_timestamp(TABLE, &id, &self.updated_at)?;
        let started_at = self
            .started_at
            .as_deref()
            .map(|v| parse_timestamp(TABLE, &id, v))
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|v| parse_timestamp(TABLE, &id, v))
            .transpose()?;
        let lease_expires_at = self
            .lease_expires_at
            .as_deref()
            .map(|v| parse_timestamp(TABLE, &id, v))
            .transpose()?;

        Ok(IndexingJob {
            workspace_id: self.workspace_id,
            config,
            status,
            stage: self.stage,
            progress_percentage: self.progress_percentage.clamp(0, 100) as u8,
            result,
            error_message: self.error_message,
            files_processed: to_u64(self.files_processed),
            entities_extracted: to_u64(self.entities_extracted),
            relationships_extracted: to_u64(self.relationships_extracted),
            retry_count: to_u32(self.retry_count),
            max_retries: to_u32(self.max_retries),
            created_by: self.created_by,
            created_at,
            started_at,
            completed_at,
            updated_at,
            lease_owner: self.lease_owner,
            lease_expires_at,
            id,
        })
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

/// Listing filter for jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub workspace_id: Option<String>,
    pub limit: Option<u64>,
}

fn upsert_in(conn: &Connection, row: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO indexing_jobs (id, workspace_id, config, status, stage,
         progress_percentage, result, error_message, files_processed, entities_extracted,
         relationships_extracted, retry_count, max_retries, created_by, created_at,
         started_at, completed_at, updated_at, lease_owner, lease_expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                 ?19, ?20)
         ON CONFLICT(id) DO UPDATE SET
           workspace_id=excluded.workspace_id, config=excluded.config,
           status=excluded.status, stage=excluded.stage,
           progress_percentage=excluded.progress_percentage, result=excluded.result,
           error_message=excluded.error_message, files_processed=excluded.files_processed,
           entities_extracted=excluded.entities_extracted,
           relationships_extracted=excluded.relationships_extracted,
           retry_count=excluded.retry_count, max_retries=excluded.max_retries,
           created_by=excluded.created_by, started_at=excluded.started_at,
           completed_at=excluded.completed_at, updated_at=excluded.updated_at,
           lease_owner=excluded.lease_owner, lease_expires_at=excluded.lease_expires_at",
        params![
            row.id,
            row.workspace_id,
            row.config,
            row.status,
            row.stage,
            row.progress_percentage,
            row.result,
            row.error_message,
            row.files_processed,
            row.entities_extracted,
            row.relationships_extracted,
            row.retry_count,
            row.max_retries,
            row.created_by,
            row.created_at,
            row.started_at,
            row.completed_at,
            row.updated_at,
            row.lease_owner,
            row.lease_expires_at,
        ],
    )?;
    Ok(())
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let sql = format!("SELECT {} FROM indexing_jobs WHERE id = ?1", COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], JobRow::from_row)
        .optional()?)
}

/// Inserts a job, or overwrites every mutable column of an existing one.
/// `created_at` is kept from the first insert.
pub fn upsert(db: &Database, job: &IndexingJob) -> Result<(), DatabaseError> {
    let row = JobRow::from_job(job)?;
    db.with_conn(|conn| upsert_in(conn, &row))
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<IndexingJob>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))?
        .map(JobRow::into_job)
        .transpose()
}

/// Queries jobs newest-first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<Vec<IndexingJob>, DatabaseError> {
    let rows = db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }
        if let Some(ref workspace_id) = filter.workspace_id {
            conditions.push(format!("workspace_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(workspace_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        param_values.push(Box::new(limit));
        let sql = format!(
            "SELECT {} FROM indexing_jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
            COLUMNS,
            where_clause,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    rows.into_iter().map(JobRow::into_job).collect()
}

/// Same as [`query`] but projected to summaries.
pub fn query_summaries(
    db: &Database,
    filter: &JobFilter,
) -> Result<Vec<JobSummary>, DatabaseError> {
    Ok(query(db, filter)?.iter().map(IndexingJob::summary).collect())
}

/// IDs of jobs currently in `status`, oldest first.
pub fn ids_by_status(db: &Database, status: JobStatus) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM indexing_jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let ids = stmt
            .query_map(params![status.as_str()], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    })
}

/// Number of jobs per status. Statuses with no jobs are omitted.
pub fn count_by_status(db: &Database) -> Result<Vec<(JobStatus, u64)>, DatabaseError> {
    let raw: Vec<(String, i64)> = db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM indexing_jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    raw.into_iter()
        .map(|(status, count)| {
            let parsed: JobStatus = status.parse().map_err(|_| DatabaseError::CorruptRow {
                table: TABLE,
                id: String::from("*"),
                reason: format!("unknown status '{}'", status),
            })?;
            Ok((parsed, to_u64(count)))
        })
        .collect()
}

/// Atomically loads job `id`, applies `f` and writes the result back.
///
/// Returns `Ok(None)` when the job does not exist. When `f` fails the
/// transaction is rolled back and the stored job is left untouched.
pub fn modify<F, E>(db: &Database, id: &str, f: F) -> Result<Option<IndexingJob>, E>
where
    F: FnOnce(&mut IndexingJob) -> Result<(), E>,
    E: From<DatabaseError>,
{
    let outcome = db.with_conn(|conn| {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let Some(row) = find_in(&tx, id)? else {
            return Ok(None);
        };
        let mut job = row.into_job()?;
        if let Err(e) = f(&mut job) {
            // Dropping the transaction rolls it back.
            return Ok(Some(Err(e)));
        }
        upsert_in(&tx, &JobRow::from_job(&job)?)?;
        tx.commit()?;
        Ok(Some(Ok(job)))
    })?;

    match outcome {
        None => Ok(None),
        Some(result) => result.map(Some),
    }
}
