//! Redis queue semantics shared by the API, the CLI and the workers.
//!
//! Jobs are pushed on the right of `arena:queue:grading` and moved atomically
//! into `arena:queue:grading:processing` when a worker takes them. The worker
//! removes the entry once the job record is written, so a crashed worker
//! leaves its job in the processing list where `requeue_stalled` can find it.

use crate::types::{GradingJob, JobRecord, JobResult, JobStatus, QueuedJob};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

pub const QUEUE_PREFIX: &str = "arena:queue";
pub const JOB_PREFIX: &str = "arena:job";
pub const GRADING_QUEUE: &str = "grading";

/// Job records expire after a day
pub const JOB_TTL_SECS: u64 = 86400;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed queue payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

pub fn queue_name(queue: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, queue)
}

pub fn processing_name(queue: &str) -> String {
    format!("{}:{}:processing", QUEUE_PREFIX, queue)
}

pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Enqueue a grading job and record it as `queued`
pub async fn push_job(conn: &mut ConnectionManager, job: GradingJob) -> QueueResult<QueuedJob> {
    let queued = QueuedJob::new(job);
    let _: () = enqueue_pipeline(&queued)?.query_async(conn).await?;
    Ok(queued)
}

/// Record and queue entry in one MULTI/EXEC: no record without its entry
fn enqueue_pipeline(queued: &QueuedJob) -> QueueResult<redis::Pipeline> {
    let record = serde_json::to_string(&JobRecord::queued(queued))?;
    let payload = serde_json::to_string(queued)?;

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(job_key(&queued.id))
        .arg(record)
        .arg("EX")
        .arg(JOB_TTL_SECS)
        .ignore()
        .rpush(queue_name(GRADING_QUEUE), payload)
        .ignore();
    Ok(pipe)
}

/// A job taken off the queue; `raw` is kept to acknowledge it later
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedJob,
    raw: String,
}

/// Block up to `timeout_seconds` for the next job.
///
/// An envelope that does not parse is dropped from the processing list and
/// reported as an error so it cannot wedge the queue.
pub async fn pop_job(
    conn: &mut ConnectionManager,
    timeout_seconds: f64,
) -> QueueResult<Option<Delivery>> {
    let processing = processing_name(GRADING_QUEUE);
    let raw: Option<String> = redis::cmd("BLMOVE")
        .arg(queue_name(GRADING_QUEUE))
        .arg(&processing)
        .arg("LEFT")
        .arg("RIGHT")
        .arg(timeout_seconds)
        .query_async(conn)
        .await?;

    let Some(raw) = raw else {
        return Ok(None);
    };

    match serde_json::from_str::<QueuedJob>(&raw) {
        Ok(job) => Ok(Some(Delivery { job, raw })),
        Err(e) => {
            let _: i64 = conn.lrem(&processing, 1, &raw).await?;
            Err(QueueError::Payload(e))
        }
    }
}

/// Remove a finished delivery from the processing list
pub async fn ack_job(conn: &mut ConnectionManager, delivery: &Delivery) -> QueueResult<()> {
    let _: i64 = conn
        .lrem(processing_name(GRADING_QUEUE), 1, &delivery.raw)
        .await?;
    Ok(())
}

/// Move every in-flight envelope back onto the queue. Returns how many moved.
pub async fn requeue_stalled(conn: &mut ConnectionManager) -> QueueResult<usize> {
    let processing = processing_name(GRADING_QUEUE);
    let queue = queue_name(GRADING_QUEUE);
    let mut moved = 0;

    loop {
        let raw: Option<String> = redis::cmd("LMOVE")
            .arg(&processing)
            .arg(&queue)
            .arg("LEFT")
            .arg("LEFT")
            .query_async(conn)
            .await?;
        match raw {
            Some(_) => moved += 1,
            None => break,
        }
    }

    Ok(moved)
}

pub async fn mark_running(conn: &mut ConnectionManager, job: &QueuedJob) -> QueueResult<()> {
    let record = JobRecord::queued(job).with_status(JobStatus::Running);
    write_record(conn, &record).await
}

pub async fn mark_finished(
    conn: &mut ConnectionManager,
    job: &QueuedJob,
    result: JobResult,
) -> QueueResult<()> {
    let mut record = JobRecord::queued(job).with_status(JobStatus::Finished);
    record.result = Some(result);
    write_record(conn, &record).await
}

pub async fn mark_failed(
    conn: &mut ConnectionManager,
    job: &QueuedJob,
    error: impl Into<String>,
) -> QueueResult<()> {
    let mut record = JobRecord::queued(job).with_status(JobStatus::Failed);
    record.error = Some(error.into());
    write_record(conn, &record).await
}

pub async fn get_job(conn: &mut ConnectionManager, job_id: &Uuid) -> QueueResult<Option<JobRecord>> {
    let payload: Option<String> = conn.get(job_key(job_id)).await?;
    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

async fn write_record(conn: &mut ConnectionManager, record: &JobRecord) -> QueueResult<()> {
    let payload = serde_json::to_string(record)?;
    let _: () = redis::cmd("SET")
        .arg(job_key(&record.id))
        .arg(payload)
        .arg("EX")
        .arg(JOB_TTL_SECS)
        .query_async(conn)
        .await?;
    Ok(())
}
