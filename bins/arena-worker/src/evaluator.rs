/// Test Evaluator - Language-Agnostic Classification
///
/// **Core Responsibility:**
/// Turn the outcome of running one test case into a `TestResult`.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or language runtimes
/// - Knows nothing about Redis
/// - `classify` is a pure function: (test case, outcome) → result
///
/// **Classification Priority:**
/// 1. Timeout → failed, "timeout"
/// 2. Compile error → failed, compiler diagnostics
/// 3. Any other execution error → failed, error message
/// 4. Expected output present → trimmed comparison of stdout
/// 5. No expected output → passed, stdout recorded
///
/// The exit code is never consulted: only stdout decides.

use crate::runner::{LanguageRunner, Program, RunError};
use crate::sandbox::ExecOutput;
use arena_common::types::{TestCase, TestResult};

pub const TIMEOUT_OUTPUT: &str = "timeout";
pub const UNSUPPORTED_OUTPUT: &str = "unsupported language";

/// Normalize output string for comparison
///
/// Trims leading/trailing whitespace (which also absorbs `\r\n` vs `\n` at
/// the end). Internal whitespace and case are preserved.
fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// What a failed result records for an execution error
pub fn failure_output(err: &RunError) -> String {
    match err {
        RunError::Timeout => TIMEOUT_OUTPUT.to_string(),
        RunError::Compile { diagnostics } => diagnostics.clone(),
        RunError::UnsupportedLanguage => UNSUPPORTED_OUTPUT.to_string(),
        other => other.to_string(),
    }
}

pub fn classify(
    submission_id: &str,
    case: &TestCase,
    outcome: &Result<ExecOutput, RunError>,
) -> TestResult {
    let output = match outcome {
        Ok(output) => output,
        Err(err) => return TestResult::failed(submission_id, case, failure_output(err)),
    };

    match &case.expected {
        Some(expected) => {
            if normalize_output(&output.stdout) == normalize_output(expected) {
                TestResult::passed(submission_id, case, None)
            } else {
                TestResult::failed(submission_id, case, output.stdout.clone())
            }
        }
        None => TestResult::passed(submission_id, case, Some(output.stdout.clone())),
    }
}

/// Run one test case against a prepared program
///
/// `program` is the shared outcome of the run's prepare phase: when it
/// failed (compile error, staging error) the runner is not invoked.
pub async fn evaluate(
    runner: &dyn LanguageRunner,
    program: &Result<Program, RunError>,
    case: &TestCase,
    submission_id: &str,
) -> TestResult {
    let outcome = match program {
        Ok(program) => runner.execute(program, &case.input).await,
        Err(err) => return TestResult::failed(submission_id, case, failure_output(err)),
    };

    classify(submission_id, case, &outcome)
}

/// Result for a submission whose language has no runner
pub fn unsupported(submission_id: &str, case: &TestCase) -> TestResult {
    TestResult::failed(submission_id, case, failure_output(&RunError::UnsupportedLanguage))
}
