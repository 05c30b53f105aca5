use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult};
use uuid::Uuid;

use crate::languages::Language;
use crate::types::{CompletionEvent, JobReport, JobRequest, JobStatus};

/// Redis queue semantics
/// Keeps API and worker from drifting: key names are deterministic and
/// every read/write of a job goes through these helpers.

pub const QUEUE_PREFIX: &str = "gavel:queue";
pub const RESULT_PREFIX: &str = "gavel:result";
pub const STATUS_PREFIX: &str = "gavel:status";
pub const COMPLETIONS_CHANNEL: &str = "gavel:events:completions";

/// Generate deterministic queue name for a language
pub fn queue_name(language: &Language) -> String {
    format!("{}:{}", QUEUE_PREFIX, language)
}

/// Generate result key for a job
pub fn result_key(job_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

/// Generate status key for a job
pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

fn decode_error(what: &'static str, err: serde_json::Error) -> RedisError {
    RedisError::from((redis::ErrorKind::TypeError, what, err.to_string()))
}

fn encode<T: serde::Serialize>(value: &T, what: &'static str) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| decode_error(what, e))
}

/// Queue a job on its language's queue and mark it queued.
pub async fn push_job(
    conn: &mut ConnectionManager,
    language: &Language,
    job: &JobRequest,
    ttl_secs: u64,
) -> RedisResult<()> {
    let payload = encode(job, "invalid job payload")?;
    set_status(conn, &job.id, JobStatus::Queued, ttl_secs).await?;
    redis::cmd("RPUSH")
        .arg(queue_name(language))
        .arg(payload)
        .query_async::<_, ()>(conn)
        .await
}

/// Blocking pop across the given language queues.
/// Returns `None` when `timeout_secs` elapses with nothing queued.
pub async fn pop_job(
    conn: &mut ConnectionManager,
    languages: &[Language],
    timeout_secs: f64,
) -> RedisResult<Option<JobRequest>> {
    let mut cmd = redis::cmd("BLPOP");
    for language in languages {
        cmd.arg(queue_name(language));
    }
    cmd.arg(timeout_secs);

    let popped: Option<(String, String)> = cmd.query_async(conn).await?;
    match popped {
        Some((_queue, payload)) => serde_json::from_str(&payload)
            .map(Some)
            .map_err(|e| decode_error("invalid job payload", e)),
        None => Ok(None),
    }
}

pub async fn set_status(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
    status: JobStatus,
    ttl_secs: u64,
) -> RedisResult<()> {
    redis::cmd("SET")
        .arg(status_key(job_id))
        .arg(encode(&status, "invalid status")?)
        .arg("EX")
        .arg(ttl_secs)
        .query_async::<_, ()>(conn)
        .await
}

pub async fn get_status(conn: &mut ConnectionManager, job_id: &Uuid) -> RedisResult<Option<JobStatus>> {
    let raw: Option<String> = redis::cmd("GET").arg(status_key(job_id)).query_async(conn).await?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| decode_error("invalid status", e)))
        .transpose()
}

/// Store a finished report and move the job to its final status.
pub async fn store_result(conn: &mut ConnectionManager, report: &JobReport, ttl_secs: u64) -> RedisResult<()> {
    redis::cmd("SET")
        .arg(result_key(&report.job_id))
        .arg(encode(report, "invalid job report")?)
        .arg("EX")
        .arg(ttl_secs)
        .query_async::<_, ()>(conn)
        .await?;
    set_status(conn, &report.job_id, report.status, ttl_secs).await
}

pub async fn get_result(conn: &mut ConnectionManager, job_id: &Uuid) -> RedisResult<Option<JobReport>> {
    let raw: Option<String> = redis::cmd("GET").arg(result_key(job_id)).query_async(conn).await?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| decode_error("invalid job report", e)))
        .transpose()
}

pub async fn publish_completion(conn: &mut ConnectionManager, event: &CompletionEvent) -> RedisResult<()> {
    redis::cmd("PUBLISH")
        .arg(COMPLETIONS_CHANNEL)
        .arg(encode(event, "invalid completion event")?)
        .query_async::<_, ()>(conn)
        .await
}
