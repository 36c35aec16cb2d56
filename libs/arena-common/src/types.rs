use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Languages the grader knows how to run.
///
/// Anything that does not parse to a supported runtime is kept verbatim in
/// `Unsupported` so it can still be reported back to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Language {
    Python,
    C,
    Unsupported(String),
}

impl Language {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Language::Python,
            "c" => Language::C,
            _ => Language::Unsupported(name.to_string()),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Language::Unsupported(_))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::C => write!(f, "c"),
            Language::Unsupported(name) => write!(f, "{}", name),
        }
    }
}

impl From<String> for Language {
    fn from(value: String) -> Self {
        Language::parse(&value)
    }
}

impl From<&str> for Language {
    fn from(value: &str) -> Self {
        Language::parse(value)
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Passed,
    Failed,
}

impl Default for SubmissionStatus {
    fn default() -> Self {
        SubmissionStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub student_id: String,
    pub task_id: String,
    pub project_id: String,
    /// Path of the stored source file on the worker's filesystem
    pub file_url: String,
    pub language: Language,
    #[serde(default)]
    pub status: SubmissionStatus,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub passed_tests: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    /// Fed to the program on stdin
    #[serde(default)]
    pub input: String,
    /// Exact-match reference output; absent means capture only
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub points: u32,
    #[serde(default)]
    pub order_index: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub submission_id: String,
    pub test_case_id: String,
    pub task_id: String,
    pub name: String,
    pub status: TestStatus,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
}

impl TestResult {
    pub fn passed(submission_id: &str, case: &TestCase, actual_output: Option<String>) -> Self {
        Self {
            submission_id: submission_id.to_string(),
            test_case_id: case.id.clone(),
            task_id: case.task_id.clone(),
            name: case.name.clone(),
            status: TestStatus::Passed,
            passed: true,
            actual_output,
        }
    }

    pub fn failed(submission_id: &str, case: &TestCase, actual_output: impl Into<String>) -> Self {
        Self {
            submission_id: submission_id.to_string(),
            test_case_id: case.id.clone(),
            task_id: case.task_id.clone(),
            name: case.name.clone(),
            status: TestStatus::Failed,
            passed: false,
            actual_output: Some(actual_output.into()),
        }
    }
}

/// Aggregate outcome of one grading run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub passed_tests: u32,
    pub score: u32,
}

impl Verdict {
    /// `failed` iff at least one result failed; an empty run passes.
    pub fn from_results(cases: &[TestCase], results: &[TestResult]) -> Self {
        let mut passed_tests = 0;
        let mut score = 0;
        for result in results.iter().filter(|r| r.passed) {
            passed_tests += 1;
            score += cases
                .iter()
                .find(|c| c.id == result.test_case_id)
                .map(|c| c.points)
                .unwrap_or(0);
        }

        let status = if results.iter().any(|r| !r.passed) {
            SubmissionStatus::Failed
        } else {
            SubmissionStatus::Passed
        };

        Self { status, passed_tests, score }
    }
}

/// Payload handed from the HTTP layer to a grading worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingJob {
    pub submission_id: String,
    pub task_id: String,
    pub project_id: String,
    pub user_id: String,
    pub language: String,
    pub file_url: String,
}

impl GradingJob {
    pub fn language(&self) -> Language {
        Language::parse(&self.language)
    }
}

/// Queue envelope: the payload plus the id callers poll with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub job: GradingJob,
}

impl QueuedJob {
    pub fn new(job: GradingJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            job,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    Done,
}

/// Value returned by a grading run: `{status: "done", results: N}` or `{error: reason}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Done { status: Completion, results: usize },
    Error { error: String },
}

impl JobResult {
    pub fn done(results: usize) -> Self {
        JobResult::Done {
            status: Completion::Done,
            results,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        JobResult::Error { error: reason.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<JobResult>,
    /// Set when the run itself failed (store outage, worker error)
    #[serde(default)]
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn queued(job: &QueuedJob) -> Self {
        Self {
            id: job.id,
            status: JobStatus::Queued,
            result: None,
            error: None,
            enqueued_at: job.enqueued_at,
            updated_at: job.enqueued_at,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(id: &str, points: u32) -> TestCase {
        TestCase {
            id: id.to_string(),
            task_id: "task-1".to_string(),
            name: format!("case {}", id),
            input: String::new(),
            expected: None,
            points,
            order_index: 0,
        }
    }

    #[test]
    fn test_language_parsing_is_closed() {
        assert_eq!(Language::parse("Python"), Language::Python);
        assert_eq!(Language::parse("python3"), Language::Python);
        assert_eq!(Language::parse("C"), Language::C);
        assert_eq!(Language::parse("Java"), Language::Unsupported("Java".to_string()));
        // no prefix matching
        assert_eq!(Language::parse("C++"), Language::Unsupported("C++".to_string()));
        assert!(!Language::parse("Java").is_supported());
    }

    #[test]
    fn test_language_serializes_as_string() {
        let json = serde_json::to_string(&Language::Python).unwrap();
        assert_eq!(json, "\"python\"");
        let lang: Language = serde_json::from_str("\"Java\"").unwrap();
        assert_eq!(lang, Language::Unsupported("Java".to_string()));
    }

    #[test]
    fn test_job_result_wire_format() {
        let done = serde_json::to_value(JobResult::done(3)).unwrap();
        assert_eq!(done, serde_json::json!({"status": "done", "results": 3}));

        let err = serde_json::to_value(JobResult::error("submission not found")).unwrap();
        assert_eq!(err, serde_json::json!({"error": "submission not found"}));

        let parsed: JobResult = serde_json::from_value(done).unwrap();
        assert_eq!(parsed, JobResult::done(3));
    }

    #[test]
    fn test_verdict_fails_when_any_result_fails() {
        let cases = vec![case("a", 10), case("b", 5)];
        let results = vec![
            TestResult::passed("s1", &cases[0], None),
            TestResult::failed("s1", &cases[1], "8"),
        ];

        let verdict = Verdict::from_results(&cases, &results);
        assert_eq!(verdict.status, SubmissionStatus::Failed);
        assert_eq!(verdict.passed_tests, 1);
        assert_eq!(verdict.score, 10);
    }

    #[test]
    fn test_verdict_passes_when_all_pass() {
        let cases = vec![case("a", 10), case("b", 5)];
        let results: Vec<_> = cases
            .iter()
            .map(|c| TestResult::passed("s1", c, None))
            .collect();

        let verdict = Verdict::from_results(&cases, &results);
        assert_eq!(verdict.status, SubmissionStatus::Passed);
        assert_eq!(verdict.passed_tests, 2);
        assert_eq!(verdict.score, 15);
    }

    #[test]
    fn test_submission_defaults_to_pending() {
        let json = serde_json::json!({
            "id": "s1",
            "student_id": "u1",
            "task_id": "t1",
            "project_id": "p1",
            "file_url": "/tmp/main.py",
            "language": "Python"
        });
        let submission: Submission = serde_json::from_value(json).unwrap();
        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(submission.language, Language::Python);
        assert!(submission.score.is_none());
    }
}
