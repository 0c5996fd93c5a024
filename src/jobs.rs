use crate::blob::LocalBlobStore;
use crate::db;
use crate::ingest::{CsvStudentIngestor, IngestError, IngestSummary, SqliteStudentSink};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{error, info, warn};

pub const UPLOADS_DIR: &str = "uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AttemptError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Failed(E),
    #[error("attempt timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
    #[error("attempt worker panicked")]
    Panicked,
    #[error("failed to start attempt worker: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug)]
pub struct RetryOutcome<T, E: std::error::Error + 'static> {
    pub attempts: u32,
    pub result: Result<T, AttemptError<E>>,
}

/// Runs `task` until it succeeds, fails with an error `retryable` rejects, or
/// `policy.max_attempts` is used up. Each attempt runs on its own thread and
/// is abandoned once `policy.timeout` passes; an abandoned attempt may still
/// finish in the background, so tasks must tolerate overlapping runs.
pub fn run_with_retry<T, E, F, R>(policy: RetryPolicy, task: F, retryable: R) -> RetryOutcome<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + 'static,
    F: Fn(u32) -> Result<T, E> + Send + Sync + 'static,
    R: Fn(&E) -> bool,
{
    let task = Arc::new(task);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = run_attempt(&task, attempt, policy.timeout);
        let err = match &result {
            Ok(_) => None,
            Err(e) => Some(e),
        };
        let retry = match err {
            None => false,
            Some(AttemptError::Failed(e)) => retryable(e),
            Some(_) => true,
        };
        if !retry || attempt >= max_attempts {
            return RetryOutcome {
                attempts: attempt,
                result,
            };
        }
        if let Some(e) = err {
            warn!(attempt, max_attempts, error = %e, "attempt failed, retrying");
        }
    }
}

fn run_attempt<T, E, F>(task: &Arc<F>, attempt: u32, timeout: Duration) -> Result<T, AttemptError<E>>
where
    T: Send + 'static,
    E: std::error::Error + Send + 'static,
    F: Fn(u32) -> Result<T, E> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    let task = Arc::clone(task);
    std::thread::Builder::new()
        .name(format!("job-attempt-{attempt}"))
        .spawn(move || {
            let _ = tx.send(task(attempt));
        })
        .map_err(AttemptError::Spawn)?;
    match rx.recv_timeout(timeout) {
        Ok(r) => r.map_err(AttemptError::Failed),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(AttemptError::TimedOut(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(AttemptError::Panicked),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("workspace database unavailable: {0:#}")]
    Store(anyhow::Error),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ingest(e) => e.is_retryable(),
            Self::Store(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJob {
    pub id: String,
    pub campus: String,
    pub original_name: String,
    pub upload_path: String,
    pub sha256: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

const JOB_COLUMNS: &str = "id, campus, original_name, upload_path, sha256, status, attempts, max_attempts, last_error, summary_json, created_at, updated_at";

fn read_job(r: &rusqlite::Row<'_>) -> rusqlite::Result<IngestJob> {
    let summary_json: Option<String> = r.get(9)?;
    Ok(IngestJob {
        id: r.get(0)?,
        campus: r.get(1)?,
        original_name: r.get(2)?,
        upload_path: r.get(3)?,
        sha256: r.get(4)?,
        status: r.get(5)?,
        attempts: r.get(6)?,
        max_attempts: r.get(7)?,
        last_error: r.get(8)?,
        summary: summary_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: r.get(10)?,
        updated_at: r.get(11)?,
    })
}

pub fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.to_string_lossy()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Stores a copy of `in_path` in the workspace upload area and queues it.
pub fn enqueue(
    conn: &Connection,
    workspace: &Path,
    in_path: &Path,
    campus: &str,
    max_attempts: u32,
) -> anyhow::Result<IngestJob> {
    let id = uuid::Uuid::new_v4().to_string();
    let original_name = in_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| in_path.to_string_lossy().to_string());
    let blobs = LocalBlobStore::new(workspace.join(UPLOADS_DIR));
    let stored = blobs.put_file(in_path, &format!("{id}.csv"))?;
    let sha256 = file_sha256(&stored)?;

    conn.execute(
        "INSERT INTO ingest_jobs(id, campus, original_name, upload_path, sha256, status, attempts, max_attempts, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?, ?)",
        params![
            id,
            campus,
            original_name,
            stored.to_string_lossy().to_string(),
            sha256,
            JobStatus::Queued.as_str(),
            max_attempts as i64,
            Utc::now(),
        ],
    )?;
    info!(job_id = %id, campus, file = %original_name, "ingest job queued");

    get_job(conn, &id)?.context("queued job vanished")
}

pub fn get_job(conn: &Connection, id: &str) -> anyhow::Result<Option<IngestJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM ingest_jobs WHERE id = ?");
    Ok(conn.query_row(&sql, [id], read_job).optional()?)
}

pub fn list_jobs(conn: &Connection, status: Option<JobStatus>) -> anyhow::Result<Vec<IngestJob>> {
    let mut sql = format!("SELECT {JOB_COLUMNS} FROM ingest_jobs");
    let mut args: Vec<&str> = Vec::new();
    if let Some(s) = status {
        sql.push_str(" WHERE status = ?");
        args.push(s.as_str());
    }
    sql.push_str(" ORDER BY created_at, rowid");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), read_job)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Puts jobs left `running` by an interrupted sidecar back in the queue.
/// Their uploads are still in place; re-ingesting is safe because existing
/// id numbers are ignored.
pub fn requeue_stale(conn: &Connection) -> anyhow::Result<usize> {
    let n = conn.execute(
        "UPDATE ingest_jobs SET status = ?, updated_at = ? WHERE status = ?",
        params![
            JobStatus::Queued.as_str(),
            Utc::now(),
            JobStatus::Running.as_str()
        ],
    )?;
    if n > 0 {
        warn!(jobs = n, "requeued interrupted ingest jobs");
    }
    Ok(n)
}

/// Works through queued jobs oldest first, one at a time. A job whose
/// bookkeeping fails is marked failed and the rest still run.
pub fn run_pending(
    conn: &Connection,
    workspace: &Path,
    policy: RetryPolicy,
    batch_size: usize,
    limit: Option<usize>,
) -> anyhow::Result<Vec<IngestJob>> {
    requeue_stale(conn)?;
    let mut queued = list_jobs(conn, Some(JobStatus::Queued))?;
    if let Some(n) = limit {
        queued.truncate(n);
    }
    let mut done = Vec::with_capacity(queued.len());
    for job in queued {
        if let Err(e) = process_job(conn, workspace, &job, policy, batch_size) {
            record_job_error(conn, &job, &e);
        }
        if let Some(j) = get_job(conn, &job.id)? {
            done.push(j);
        }
    }
    Ok(done)
}

fn process_job(
    conn: &Connection,
    workspace: &Path,
    job: &IngestJob,
    policy: RetryPolicy,
    batch_size: usize,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE ingest_jobs SET status = ?, updated_at = ? WHERE id = ?",
        params![JobStatus::Running.as_str(), Utc::now(), job.id],
    )?;
    info!(job_id = %job.id, campus = %job.campus, file = %job.original_name, "ingest job started");

    let policy = RetryPolicy {
        max_attempts: u32::try_from(job.max_attempts).unwrap_or(policy.max_attempts),
        ..policy
    };
    let ws = workspace.to_path_buf();
    let upload = PathBuf::from(&job.upload_path);
    let job_id = job.id.clone();
    let campus = job.campus.clone();
    let outcome = run_with_retry(
        policy,
        move |attempt| run_ingest_attempt(&ws, &upload, &job_id, &campus, attempt, batch_size),
        JobError::is_retryable,
    );

    match outcome.result {
        Ok(summary) => {
            conn.execute(
                "UPDATE ingest_jobs SET status = ?, attempts = ?, last_error = NULL, summary_json = ?, updated_at = ? WHERE id = ?",
                params![
                    JobStatus::Completed.as_str(),
                    outcome.attempts as i64,
                    serde_json::to_string(&summary)?,
                    Utc::now(),
                    job.id,
                ],
            )?;
            remove_upload(job);
            info!(
                job_id = %job.id,
                attempts = outcome.attempts,
                inserted = summary.inserted,
                "ingest job completed"
            );
        }
        Err(e) => on_job_failed(conn, job, outcome.attempts, &e)?,
    }
    Ok(())
}

/// One attempt works on its own staged copy so the ingestor's cleanup never
/// removes the upload a later attempt needs.
fn run_ingest_attempt(
    workspace: &Path,
    upload: &Path,
    job_id: &str,
    campus: &str,
    attempt: u32,
    batch_size: usize,
) -> Result<IngestSummary, JobError> {
    if !upload.is_file() {
        return Err(IngestError::SourceNotFound {
            path: upload.to_path_buf(),
        }
        .into());
    }
    let uploads = workspace.join(UPLOADS_DIR);
    let staged = uploads.join(format!("{job_id}.attempt{attempt}.csv"));
    std::fs::copy(upload, &staged).map_err(|source| IngestError::SourceUnreadable {
        path: upload.to_path_buf(),
        source,
    })?;

    let conn = match db::open_db(workspace) {
        Ok(c) => c,
        Err(e) => {
            if let Err(rm) = std::fs::remove_file(&staged) {
                warn!(job_id, path = %staged.display(), error = %rm, "failed to remove staged upload");
            }
            return Err(JobError::Store(e));
        }
    };
    let blobs = LocalBlobStore::new(uploads);
    let summary = CsvStudentIngestor::new(&blobs, SqliteStudentSink::new(&conn))
        .with_batch_size(batch_size)
        .ingest(&staged, campus)?;
    Ok(summary)
}

fn remove_upload(job: &IngestJob) {
    let path = Path::new(&job.upload_path);
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        warn!(job_id = %job.id, path = %job.upload_path, error = %e, "failed to remove upload");
    }
}

/// Last resort when a job's own status updates fail. If this write fails too
/// the row stays `running` and the next run requeues it.
fn record_job_error(conn: &Connection, job: &IngestJob, e: &anyhow::Error) {
    let message = format!("{e:#}");
    error!(
        job_id = %job.id,
        campus = %job.campus,
        file = %job.original_name,
        path = %job.upload_path,
        error = %message,
        "ingest job aborted"
    );
    let marked = conn.execute(
        "UPDATE ingest_jobs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        params![JobStatus::Failed.as_str(), message, Utc::now(), job.id],
    );
    match marked {
        Ok(_) => remove_upload(job),
        Err(e) => warn!(job_id = %job.id, error = %e, "failed to record job failure"),
    }
}

/// Final failure hook: drops the upload and records enough context to find
/// and re-submit the file.
fn on_job_failed(
    conn: &Connection,
    job: &IngestJob,
    attempts: u32,
    e: &AttemptError<JobError>,
) -> anyhow::Result<()> {
    remove_upload(job);
    let message = e.to_string();
    conn.execute(
        "UPDATE ingest_jobs SET status = ?, attempts = ?, last_error = ?, updated_at = ? WHERE id = ?",
        params![
            JobStatus::Failed.as_str(),
            attempts as i64,
            message,
            Utc::now(),
            job.id,
        ],
    )?;
    error!(
        job_id = %job.id,
        campus = %job.campus,
        file = %job.original_name,
        path = %job.upload_path,
        attempts,
        error = %message,
        "ingest job failed"
    );
    Ok(())
}
