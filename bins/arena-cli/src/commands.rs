// Operator commands for the Arena grading queue
use anyhow::{bail, Context, Result};
use arena_common::queue;
use arena_common::store::{RedisStore, SubmissionStore, TestResultStore};
use arena_common::types::{GradingJob, Submission, TestCase};
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Read a JSON document from disk
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Split a flat list of test cases by the task they belong to
fn group_by_task(cases: Vec<TestCase>) -> BTreeMap<String, Vec<TestCase>> {
    let mut tasks: BTreeMap<String, Vec<TestCase>> = BTreeMap::new();
    for case in cases {
        tasks.entry(case.task_id.clone()).or_default().push(case);
    }
    tasks
}

/// Store submissions and test cases from JSON files
pub async fn seed(
    conn: ConnectionManager,
    submissions: Option<&Path>,
    test_cases: Option<&Path>,
) -> Result<()> {
    if submissions.is_none() && test_cases.is_none() {
        bail!("Nothing to seed: pass --submissions and/or --test-cases");
    }

    let store = RedisStore::new(conn);

    if let Some(path) = submissions {
        let records: Vec<Submission> = load_json(path)?;
        println!("📝 Seeding {} submission(s) from {}...", records.len(), path.display());
        for submission in &records {
            store.put_submission(submission).await?;
            println!("  ✅ {} ({}, {})", submission.id, submission.language, submission.file_url);
        }
    }

    if let Some(path) = test_cases {
        let cases: Vec<TestCase> = load_json(path)?;
        println!("📝 Seeding {} test case(s) from {}...", cases.len(), path.display());
        for (task_id, cases) in group_by_task(cases) {
            store.put_test_cases(&task_id, &cases).await?;
            println!("  ✅ task {}: {} test case(s)", task_id, cases.len());
        }
    }

    println!("✅ Seed complete");
    Ok(())
}

/// Queue a stored submission for grading, bypassing the HTTP API
pub async fn enqueue(
    mut conn: ConnectionManager,
    submission_id: &str,
    task_id: &str,
    project_id: &str,
    language: Option<&str>,
) -> Result<()> {
    let store = RedisStore::new(conn.clone());
    let Some(submission) = store.get_submission(submission_id).await? else {
        bail!("Submission '{}' doesn't exist", submission_id);
    };

    let job = GradingJob {
        submission_id: submission.id.clone(),
        task_id: task_id.to_string(),
        project_id: project_id.to_string(),
        user_id: submission.student_id.clone(),
        language: language
            .map(str::to_string)
            .unwrap_or_else(|| submission.language.to_string()),
        file_url: submission.file_url.clone(),
    };

    let queued = queue::push_job(&mut conn, job)
        .await
        .context("Failed to enqueue grading job")?;

    println!("🚀 Queued grading job");
    println!("  Job ID:     {}", queued.id);
    println!("  Submission: {}", submission_id);
    println!("  Language:   {}", queued.job.language);
    println!("\n💡 Check progress with: arena-cli status {}", queued.id);
    Ok(())
}

/// Print a job record, plus the stored results when asked
pub async fn status(mut conn: ConnectionManager, job_id: &str, results_for: Option<&str>) -> Result<()> {
    let id = Uuid::parse_str(job_id).with_context(|| format!("Invalid job ID: {}", job_id))?;

    match queue::get_job(&mut conn, &id).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => bail!("Job '{}' not found (unknown or expired)", job_id),
    }

    if let Some(submission_id) = results_for {
        let store = RedisStore::new(conn);
        let results = store.results(submission_id).await?;
        println!("\n📋 Results for submission {}:\n", submission_id);
        println!("{:<24} {:<28} {:<8}", "TEST CASE", "NAME", "STATUS");
        println!("{}", "─".repeat(62));
        for result in &results {
            let status = if result.passed { "passed" } else { "failed" };
            println!("{:<24} {:<28} {:<8}", result.test_case_id, result.name, status);
        }
        println!("\n✅ Total: {} result(s)", results.len());
    }

    Ok(())
}

/// Move jobs stranded in the processing list back onto the queue
pub async fn recover(mut conn: ConnectionManager) -> Result<()> {
    println!("🔁 Requeueing stalled jobs...");
    let moved = queue::requeue_stalled(&mut conn).await?;
    if moved == 0 {
        println!("✅ Nothing to recover");
    } else {
        println!("✅ Requeued {} job(s)", moved);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn case(id: &str, task_id: &str) -> TestCase {
        TestCase {
            id: id.to_string(),
            task_id: task_id.to_string(),
            name: id.to_string(),
            input: String::new(),
            expected: None,
            points: 1,
            order_index: 0,
        }
    }

    #[test]
    fn test_group_by_task_keeps_file_order() {
        let grouped = group_by_task(vec![case("a", "t1"), case("b", "t2"), case("c", "t1")]);

        assert_eq!(grouped.len(), 2);
        let t1: Vec<&str> = grouped["t1"].iter().map(|c| c.id.as_str()).collect();
        assert_eq!(t1, vec!["a", "c"]);
    }

    #[test]
    fn test_load_json_reports_path_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = load_json::<Vec<TestCase>>(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_load_test_cases_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "1", "task_id": "t1", "name": "sum", "input": "3 4", "expected": "7", "points": 10, "order_index": 0}}]"#
        )
        .unwrap();

        let cases: Vec<TestCase> = load_json(file.path()).unwrap();
        assert_eq!(cases[0].expected.as_deref(), Some("7"));
        assert_eq!(cases[0].points, 10);
    }
}
