//! Persistence seams consumed by the grader.
//!
//! The grader only ever talks to these traits. `RedisStore` is the
//! production implementation; the records live as JSON documents next to the
//! job queue so a worker needs a single connection.

use crate::types::{Submission, TestCase, TestResult, Verdict};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

pub const SUBMISSION_PREFIX: &str = "arena:submission";
pub const TASK_PREFIX: &str = "arena:task";
pub const LEASE_PREFIX: &str = "arena:lease:submission";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("submission {0} does not exist")]
    MissingSubmission(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get_submission(&self, id: &str) -> StoreResult<Option<Submission>>;

    /// Write status, score and passed test count in one atomic update
    async fn save_verdict(&self, id: &str, verdict: &Verdict) -> StoreResult<()>;

    /// Claim the exclusive right to grade `id` for `ttl`. Returns false if
    /// another holder has it.
    async fn try_claim(&self, id: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Push a held claim's expiry out to `ttl`. Returns false if `token` no
    /// longer owns it.
    async fn renew(&self, id: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Drop a claim, but only if `token` still owns it
    async fn release(&self, id: &str, token: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait TestCaseStore: Send + Sync {
    /// `None` when the task is unknown
    async fn test_cases(&self, task_id: &str) -> StoreResult<Option<Vec<TestCase>>>;
}

#[async_trait]
pub trait TestResultStore: Send + Sync {
    /// Replace every stored result of `submission_id` with `results`
    async fn replace_results(&self, submission_id: &str, results: &[TestResult]) -> StoreResult<()>;

    async fn results(&self, submission_id: &str) -> StoreResult<Vec<TestResult>>;
}

pub fn submission_key(id: &str) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

pub fn results_key(submission_id: &str) -> String {
    format!("{}:{}:results", SUBMISSION_PREFIX, submission_id)
}

pub fn test_cases_key(task_id: &str) -> String {
    format!("{}:{}:test_cases", TASK_PREFIX, task_id)
}

pub fn lease_key(submission_id: &str) -> String {
    format!("{}:{}", LEASE_PREFIX, submission_id)
}

const SAVE_VERDICT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local submission = cjson.decode(raw)
submission['status'] = ARGV[1]
submission['passed_tests'] = tonumber(ARGV[2])
submission['score'] = tonumber(ARGV[3])
redis.call('SET', KEYS[1], cjson.encode(submission))
return 1
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed Submission / TestCase / TestResult store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn put_submission(&self, submission: &Submission) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(submission)?;
        let _: () = conn.set(submission_key(&submission.id), payload).await?;
        Ok(())
    }

    pub async fn put_test_cases(&self, task_id: &str, cases: &[TestCase]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(cases)?;
        let _: () = conn.set(test_cases_key(task_id), payload).await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn get_submission(&self, id: &str) -> StoreResult<Option<Submission>> {
        self.get_json(&submission_key(id)).await
    }

    async fn save_verdict(&self, id: &str, verdict: &Verdict) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let status = serde_json::to_value(verdict.status)?;
        let updated: i64 = redis::Script::new(SAVE_VERDICT_SCRIPT)
            .key(submission_key(id))
            .arg(status.as_str().unwrap_or_default())
            .arg(verdict.passed_tests)
            .arg(verdict.score)
            .invoke_async(&mut conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::MissingSubmission(id.to_string()));
        }
        Ok(())
    }

    async fn try_claim(&self, id: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lease_key(id))
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew(&self, id: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(lease_key(id))
            .arg(token)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, id: &str, token: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(lease_key(id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TestCaseStore for RedisStore {
    async fn test_cases(&self, task_id: &str) -> StoreResult<Option<Vec<TestCase>>> {
        self.get_json(&test_cases_key(task_id)).await
    }
}

#[async_trait]
impl TestResultStore for RedisStore {
    async fn replace_results(&self, submission_id: &str, results: &[TestResult]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(results)?;
        let _: () = conn.set(results_key(submission_id), payload).await?;
        Ok(())
    }

    async fn results(&self, submission_id: &str) -> StoreResult<Vec<TestResult>> {
        Ok(self
            .get_json(&results_key(submission_id))
            .await?
            .unwrap_or_default())
    }
}
