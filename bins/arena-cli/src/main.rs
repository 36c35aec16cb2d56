mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arena-cli")]
#[command(about = "Arena CLI - Seed grading data, queue jobs and inspect results", long_about = None)]
struct Cli {
    /// Redis URL (defaults to REDIS_URL, then redis://127.0.0.1:6379)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load submissions and test cases from JSON files
    Seed {
        /// JSON array of submissions
        #[arg(short, long)]
        submissions: Option<PathBuf>,

        /// JSON array of test cases, grouped by their task_id
        #[arg(short, long)]
        test_cases: Option<PathBuf>,
    },

    /// Queue a stored submission for grading
    Enqueue {
        /// Submission ID
        #[arg(short, long)]
        submission: String,

        /// Task ID whose test cases grade it
        #[arg(short, long)]
        task: String,

        /// Project ID
        #[arg(short, long)]
        project: String,

        /// Override the submission's language
        #[arg(short, long)]
        language: Option<String>,
    },

    /// Show a job's status and result
    Status {
        /// Job ID returned when the job was queued
        job_id: String,

        /// Also list the stored test results of this submission
        #[arg(long)]
        results: Option<String>,
    },

    /// Requeue jobs left in flight by a crashed worker
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let redis_url = cli.redis_url.unwrap_or_else(arena_common::config::redis_url);
    let conn = arena_common::config::connect_redis(&redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))?;

    match cli.command {
        Commands::Seed {
            submissions,
            test_cases,
        } => {
            commands::seed(conn, submissions.as_deref(), test_cases.as_deref()).await?;
        }
        Commands::Enqueue {
            submission,
            task,
            project,
            language,
        } => {
            commands::enqueue(conn, &submission, &task, &project, language.as_deref()).await?;
        }
        Commands::Status { job_id, results } => {
            commands::status(conn, &job_id, results.as_deref()).await?;
        }
        Commands::Recover => {
            commands::recover(conn).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "arena-cli", "enqueue", "-s", "sub-1", "-t", "task-1", "-p", "proj-1",
        ])
        .unwrap();

        match cli.command {
            Commands::Enqueue { submission, language, .. } => {
                assert_eq!(submission, "sub-1");
                assert_eq!(language, None);
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_global_redis_url_after_subcommand() {
        let cli = Cli::try_parse_from(["arena-cli", "recover", "--redis-url", "redis://cache:6379"]).unwrap();
        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_status_requires_job_id() {
        assert!(Cli::try_parse_from(["arena-cli", "status"]).is_err());
    }
}
