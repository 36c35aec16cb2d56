/// Grading Orchestrator
///
/// Drives one submission through `Loaded → Running → Aggregated → Persisted`:
///
/// 1. Load the submission, its task's test cases and the submitted file.
///    A missing piece is reported as an error result and nothing is written.
///    Then claim the submission lease; a held lease is `GradeError::LeaseHeld`
///    so the caller can drop the duplicate delivery without a record write.
/// 2. Prepare the program once in a fresh workspace, then evaluate every
///    test case in `order_index` order, renewing the lease after each one.
///    A failure inside one test case never stops the others.
/// 3. Aggregate the verdict.
/// 4. Replace the stored results, then write status, score and passed count.
///
/// The workspace is removed and the lease released on every exit path.

use crate::evaluator;
use crate::runner::{RunError, RunnerSet};
use crate::workspace::Workspace;
use arena_common::store::{RedisStore, StoreError, SubmissionStore, TestCaseStore, TestResultStore};
use arena_common::types::{GradingJob, JobResult, TestCase, TestResult, Verdict};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Persistence collaborators, injected so tests can swap in fakes
#[derive(Clone)]
pub struct Stores {
    pub submissions: Arc<dyn SubmissionStore>,
    pub test_cases: Arc<dyn TestCaseStore>,
    pub results: Arc<dyn TestResultStore>,
}

impl Stores {
    pub fn redis(store: RedisStore) -> Self {
        Self {
            submissions: Arc::new(store.clone()),
            test_cases: Arc::new(store.clone()),
            results: Arc::new(store),
        }
    }
}

/// Reasons a job is answered with an error result before anything runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Precondition {
    #[error("submission not found")]
    SubmissionNotFound,
    #[error("task not found")]
    TaskNotFound,
    #[error("submitted file missing")]
    SubmittedFileMissing,
}

#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    /// Another delivery of the same submission holds the lease
    #[error("submission is already being graded")]
    LeaseHeld,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to create workspace: {0}")]
    Workspace(#[from] std::io::Error),
}

pub struct Grader {
    stores: Stores,
    runners: RunnerSet,
    scratch_root: PathBuf,
    lease_ttl: Duration,
}

impl Grader {
    pub fn new(stores: Stores, runners: RunnerSet, scratch_root: PathBuf, lease_ttl: Duration) -> Self {
        Self {
            stores,
            runners,
            scratch_root,
            lease_ttl,
        }
    }

    /// Grade one submission. `Err` means a store failure, a workspace failure,
    /// or a lease held by another delivery; the last must not touch the job record.
    #[instrument(skip(self, job), fields(submission_id = %job.submission_id, task_id = %job.task_id))]
    pub async fn grade(&self, job: &GradingJob) -> Result<JobResult, GradeError> {
        let cases = match self.load(job).await? {
            Ok(cases) => cases,
            Err(reason) => {
                warn!(reason = %reason, "Grading precondition failed");
                return Ok(JobResult::error(reason.to_string()));
            }
        };

        let token = uuid::Uuid::new_v4().to_string();
        let claimed = self
            .stores
            .submissions
            .try_claim(&job.submission_id, &token, self.lease_ttl)
            .await?;
        if !claimed {
            warn!("Submission lease held by another worker");
            return Err(GradeError::LeaseHeld);
        }

        let outcome = self.run_claimed(job, cases, &token).await;

        if let Err(e) = self.stores.submissions.release(&job.submission_id, &token).await {
            // expires on its own after the ttl
            warn!(error = %e, "Failed to release submission lease");
        }

        outcome
    }

    async fn load(&self, job: &GradingJob) -> Result<Result<Vec<TestCase>, Precondition>, StoreError> {
        if self.stores.submissions.get_submission(&job.submission_id).await?.is_none() {
            return Ok(Err(Precondition::SubmissionNotFound));
        }

        let cases = match self.stores.test_cases.test_cases(&job.task_id).await? {
            Some(cases) => cases,
            None => return Ok(Err(Precondition::TaskNotFound)),
        };

        let file_present = tokio::fs::metadata(&job.file_url)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !file_present {
            return Ok(Err(Precondition::SubmittedFileMissing));
        }

        Ok(Ok(cases))
    }

    async fn run_claimed(
        &self,
        job: &GradingJob,
        mut cases: Vec<TestCase>,
        token: &str,
    ) -> Result<JobResult, GradeError> {
        let workspace = Workspace::create(&self.scratch_root, &job.submission_id)?;
        debug!(workspace = %workspace.path().display(), "Workspace created");

        // sort_by_key is stable: ties keep their stored order
        cases.sort_by_key(|case| case.order_index);

        let start = Instant::now();
        let results = self.run_cases(job, &cases, workspace.path(), token).await;
        let verdict = Verdict::from_results(&cases, &results);

        self.stores
            .results
            .replace_results(&job.submission_id, &results)
            .await?;
        self.stores
            .submissions
            .save_verdict(&job.submission_id, &verdict)
            .await?;

        info!(
            status = ?verdict.status,
            passed_tests = verdict.passed_tests,
            total_tests = results.len(),
            score = verdict.score,
            execution_ms = start.elapsed().as_millis() as u64,
            "Submission graded"
        );

        Ok(JobResult::done(results.len()))
    }

    async fn run_cases(
        &self,
        job: &GradingJob,
        cases: &[TestCase],
        workdir: &Path,
        token: &str,
    ) -> Vec<TestResult> {
        let submission_id = job.submission_id.as_str();
        let language = job.language();

        let Some(runner) = self.runners.get(&language) else {
            warn!(language = %language, "Unsupported language");
            return cases
                .iter()
                .map(|case| evaluator::unsupported(submission_id, case))
                .collect();
        };

        let program = AssertUnwindSafe(runner.prepare(Path::new(&job.file_url), workdir))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RunError::Panic(panic_message(panic))));

        if let Err(e) = &program {
            warn!(language = %language, error = %e, "Program preparation failed");
        }

        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            let start = Instant::now();
            let result = AssertUnwindSafe(evaluator::evaluate(runner.as_ref(), &program, case, submission_id))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let err = RunError::Panic(panic_message(panic));
                    TestResult::failed(submission_id, case, err.to_string())
                });

            debug!(
                test_case_id = %case.id,
                passed = result.passed,
                execution_ms = start.elapsed().as_millis() as u64,
                "Test case evaluated"
            );
            results.push(result);
            self.renew_lease(submission_id, token).await;
        }
        results
    }

    /// Push the lease expiry out by a full ttl. A lost lease is logged and
    /// the run carries on: results are replaced wholesale, so a second
    /// grader finishing later still leaves exactly one result set.
    async fn renew_lease(&self, submission_id: &str, token: &str) {
        match self
            .stores
            .submissions
            .renew(submission_id, token, self.lease_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("Submission lease lost"),
            Err(e) => warn!(error = %e, "Failed to renew submission lease"),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
