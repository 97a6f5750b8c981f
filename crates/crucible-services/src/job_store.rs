//! Job store — durable job records in the database of record.
//!
//! SQLite in WAL mode so the API process and worker processes share one
//! file. Single-record writes only; the terminal transition is guarded
//! by a read-check inside one transaction, which makes `complete`/`fail`
//! write-once and at-least-once dispatch safe.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;

use crucible_core::job::{Job, JobResult, JobStatus, JobType, LogRecord};
use crucible_core::JobError;

/// Persisted log tail bound. Earlier records are considered lost from
/// the store; consumers read them from the bus in real time.
pub const LOG_TAIL_LIMIT: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id             TEXT PRIMARY KEY,
    job_type       TEXT NOT NULL,
    status         TEXT NOT NULL,
    owner_id       TEXT NOT NULL,
    project_id     TEXT NOT NULL,
    broker_handle  TEXT NOT NULL UNIQUE,
    result         TEXT,
    error          TEXT,
    logs           TEXT NOT NULL DEFAULT '[]',
    log_count      INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_owner_created ON jobs(owner_id, created_at DESC);

CREATE TABLE IF NOT EXISTS users (
    id                      TEXT PRIMARY KEY,
    api_token               TEXT NOT NULL UNIQUE,
    tier                    TEXT NOT NULL DEFAULT 'free',
    deploy_count            INTEGER NOT NULL DEFAULT 0,
    deploy_reset_at         TEXT NOT NULL,
    function_test_count     INTEGER NOT NULL DEFAULT 0,
    function_test_reset_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id        TEXT PRIMARY KEY,
    owner_id  TEXT NOT NULL,
    files     TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS audit_log (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id      TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    action      TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    detail      TEXT,
    created_at  TEXT NOT NULL
);
";

/// Open the store file, switch to WAL, and apply the schema. Both the
/// `JobStore` and the `Directory` wrap clones of the returned handle.
pub async fn open_store(path: &Path) -> Result<Connection, JobError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| JobError::Transient(format!("store dir: {e}")))?;
    }
    let conn = Connection::open(path)
        .await
        .map_err(|e| JobError::Transient(format!("store open: {e}")))?;
    init_schema(&conn).await?;
    Ok(conn)
}

/// In-memory store for tests.
pub async fn open_store_in_memory() -> Result<Connection, JobError> {
    let conn = Connection::open_in_memory()
        .await
        .map_err(|e| JobError::Transient(format!("store open: {e}")))?;
    init_schema(&conn).await?;
    Ok(conn)
}

async fn init_schema(conn: &Connection) -> Result<(), JobError> {
    conn.call(|conn| {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    })
    .await
    .map_err(store_err)
}

fn store_err(e: tokio_rusqlite::Error) -> JobError {
    JobError::Transient(format!("store: {e}"))
}

// ── Column codecs ─────────────────────────────────────────────────────────────

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Active => "active",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

pub fn status_from_str(s: &str) -> Option<JobStatus> {
    match s {
        "queued" => Some(JobStatus::Queued),
        "active" => Some(JobStatus::Active),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        _ => None,
    }
}

fn type_str(t: JobType) -> &'static str {
    match t {
        JobType::Compile => "compile",
        JobType::Deploy => "deploy",
    }
}

pub fn type_from_str(s: &str) -> Option<JobType> {
    match s {
        "compile" => Some(JobType::Compile),
        "deploy" => Some(JobType::Deploy),
        _ => None,
    }
}

fn bad_column<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_time(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(bad_column)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let job_type: String = row.get("job_type")?;
    let status: String = row.get("status")?;
    let result: Option<String> = row.get("result")?;
    let logs: String = row.get("logs")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let result: Option<JobResult> = match result {
        Some(text) => Some(serde_json::from_str(&text).map_err(bad_column)?),
        None => None,
    };
    let logs: Vec<LogRecord> = serde_json::from_str(&logs).map_err(bad_column)?;

    Ok(Job {
        id: row.get("id")?,
        job_type: type_from_str(&job_type)
            .ok_or_else(|| bad_column(std::fmt::Error))?,
        status: status_from_str(&status).ok_or_else(|| bad_column(std::fmt::Error))?,
        owner_id: row.get("owner_id")?,
        project_id: row.get("project_id")?,
        broker_handle: row.get("broker_handle")?,
        result,
        error: row.get("error")?,
        logs,
        log_count: row.get::<_, i64>("log_count")? as u64,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

// ── The store ─────────────────────────────────────────────────────────────────

/// Outcome of a terminal write. `fresh` is true only for the invocation
/// that actually performed the write; redeliveries and races see false
/// and skip their side effects.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub job: Job,
    pub fresh: bool,
}

/// Listing filters for the jobs endpoint. All optional.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub project_id: Option<String>,
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: Option<u32>,
}

#[derive(Clone)]
pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Insert a fresh `queued` job. Fails with `Duplicate` when the
    /// broker handle already exists.
    pub async fn create(
        &self,
        job_id: &str,
        job_type: JobType,
        owner_id: &str,
        project_id: &str,
        seed_logs: Vec<LogRecord>,
    ) -> Result<Job, JobError> {
        let now = Utc::now();
        let job = Job {
            id: job_id.to_string(),
            job_type,
            status: JobStatus::Queued,
            owner_id: owner_id.to_string(),
            project_id: project_id.to_string(),
            broker_handle: job_type.broker_handle(job_id),
            result: None,
            error: None,
            log_count: seed_logs.len() as u64,
            logs: seed_logs,
            created_at: now,
            updated_at: now,
        };

        let insert = job.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let logs = serde_json::to_string(&insert.logs)
                    .map_err(|e| tokio_rusqlite::Error::Rusqlite(bad_column(e)))?;
                match conn.execute(
                    "INSERT INTO jobs (id, job_type, status, owner_id, project_id, broker_handle,
                                       logs, log_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        insert.id,
                        type_str(insert.job_type),
                        status_str(insert.status),
                        insert.owner_id,
                        insert.project_id,
                        insert.broker_handle,
                        logs,
                        insert.log_count as i64,
                        insert.created_at.to_rfc3339(),
                        insert.updated_at.to_rfc3339(),
                    ],
                ) {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(store_err)?;

        if !inserted {
            return Err(JobError::Duplicate(job.broker_handle));
        }
        Ok(job)
    }

    /// `queued → active`. Idempotent when already active; terminal rows
    /// are left untouched.
    pub async fn mark_active(&self, job_id: &str) -> Result<(), JobError> {
        let id = job_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE jobs SET status = 'active', updated_at = ?2
                     WHERE id = ?1 AND status IN ('queued', 'active')",
                    params![id, Utc::now().to_rfc3339()],
                )?;
                if n > 0 {
                    return Ok(true);
                }
                let exists: bool = conn
                    .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
                    .is_ok();
                Ok(exists)
            })
            .await
            .map_err(store_err)?;
        if !changed {
            return Err(JobError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    /// Truncated-tail replace: persist the last `LOG_TAIL_LIMIT` records
    /// of the emitted stream plus a monotone total count.
    pub async fn append_logs(&self, job_id: &str, emitted: &[LogRecord]) -> Result<(), JobError> {
        let id = job_id.to_string();
        let count = emitted.len() as i64;
        let tail_start = emitted.len().saturating_sub(LOG_TAIL_LIMIT);
        let tail = emitted[tail_start..].to_vec();
        self.conn
            .call(move |conn| {
                let logs = serde_json::to_string(&tail)
                    .map_err(|e| tokio_rusqlite::Error::Rusqlite(bad_column(e)))?;
                conn.execute(
                    "UPDATE jobs SET logs = ?2, log_count = MAX(log_count, ?3), updated_at = ?4
                     WHERE id = ?1",
                    params![id, logs, count, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(store_err)
    }

    /// Terminal success. Write-once: a second invocation is a no-op that
    /// returns the recorded outcome with `fresh = false`.
    pub async fn complete(&self, job_id: &str, result: JobResult) -> Result<Terminal, JobError> {
        self.finish(job_id, Some(result), None, None).await
    }

    /// Terminal failure with the captured log tail. Write-once like
    /// `complete`.
    pub async fn fail(
        &self,
        job_id: &str,
        error: &str,
        logs_tail: &[LogRecord],
    ) -> Result<Terminal, JobError> {
        let tail_start = logs_tail.len().saturating_sub(LOG_TAIL_LIMIT);
        self.finish(
            job_id,
            None,
            Some(error.to_string()),
            Some((logs_tail[tail_start..].to_vec(), logs_tail.len() as i64)),
        )
        .await
    }

    async fn finish(
        &self,
        job_id: &str,
        result: Option<JobResult>,
        error: Option<String>,
        logs: Option<(Vec<LogRecord>, i64)>,
    ) -> Result<Terminal, JobError> {
        let id = job_id.to_string();
        let job = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<Job> = tx
                    .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let Some(current) = current else {
                    return Ok(None);
                };
                // Write-once anchor: the first terminal write wins.
                if current.status.is_terminal() {
                    return Ok(Some(Terminal {
                        job: current,
                        fresh: false,
                    }));
                }

                let status = if error.is_some() {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                let result_text = match &result {
                    Some(r) => Some(
                        serde_json::to_string(r)
                            .map_err(|e| tokio_rusqlite::Error::Rusqlite(bad_column(e)))?,
                    ),
                    None => None,
                };
                let now = Utc::now().to_rfc3339();
                match &logs {
                    Some((tail, count)) => {
                        let tail_text = serde_json::to_string(tail)
                            .map_err(|e| tokio_rusqlite::Error::Rusqlite(bad_column(e)))?;
                        tx.execute(
                            "UPDATE jobs SET status = ?2, result = ?3, error = ?4,
                                             logs = ?5, log_count = MAX(log_count, ?6), updated_at = ?7
                             WHERE id = ?1",
                            params![id, status_str(status), result_text, error, tail_text, count, now],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "UPDATE jobs SET status = ?2, result = ?3, error = ?4, updated_at = ?5
                             WHERE id = ?1",
                            params![id, status_str(status), result_text, error, now],
                        )?;
                    }
                }
                let updated =
                    tx.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)?;
                tx.commit()?;
                Ok(Some(Terminal {
                    job: updated,
                    fresh: true,
                }))
            })
            .await
            .map_err(store_err)?;

        job.ok_or_else(|| JobError::NotFound(format!("job {job_id}")))
    }

    /// Compensation for a failed enqueue: a row whose payload never
    /// reached the broker is withdrawn so the client's 5xx matches the
    /// store. Only `queued` rows qualify; anything a worker touched stays.
    pub async fn discard_if_queued(&self, job_id: &str) -> Result<bool, JobError> {
        let id = job_id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM jobs WHERE id = ?1 AND status = 'queued'",
                    params![id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(store_err)
    }

    /// Full persisted record, or None.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        let id = job_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other.into()),
                    })
            })
            .await
            .map_err(store_err)
    }

    /// Owner-scoped listing, newest first.
    pub async fn list(&self, owner_id: &str, filter: ListFilter) -> Result<Vec<Job>, JobError> {
        let owner = owner_id.to_string();
        self.conn
            .call(move |conn| {
                let mut sql = String::from("SELECT * FROM jobs WHERE owner_id = ?1");
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(owner)];
                if let Some(project) = filter.project_id {
                    args.push(Box::new(project));
                    sql.push_str(&format!(" AND project_id = ?{}", args.len()));
                }
                if let Some(status) = filter.status {
                    args.push(Box::new(status_str(status).to_string()));
                    sql.push_str(&format!(" AND status = ?{}", args.len()));
                }
                if let Some(job_type) = filter.job_type {
                    args.push(Box::new(type_str(job_type).to_string()));
                    sql.push_str(&format!(" AND job_type = ?{}", args.len()));
                }
                sql.push_str(" ORDER BY created_at DESC");
                let limit = filter.limit.unwrap_or(50).min(200);
                sql.push_str(&format!(" LIMIT {limit}"));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    row_to_job,
                )?;
                let mut jobs = Vec::new();
                for row in rows {
                    jobs.push(row?);
                }
                Ok(jobs)
            })
            .await
            .map_err(store_err)
    }
}
