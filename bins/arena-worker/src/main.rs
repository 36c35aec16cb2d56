mod config;
mod evaluator;
mod grader;
mod runner;
mod sandbox;
mod workspace;

use arena_common::queue::{self, Delivery};
use arena_common::store::RedisStore;
use arena_common::types::Language;
use config::{LanguageConfigManager, WorkerConfig};
use grader::{GradeError, Grader, Stores};
use runner::{Backend, RunnerSet};
use sandbox::SandboxPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Arena grading worker booting...");

    let config = WorkerConfig::from_env();

    let languages = LanguageConfigManager::load_or_builtin(&config.languages_path).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());
    for name in languages.list_languages() {
        let lang_config = languages.get_config(&Language::parse(&name))?;
        info!(
            language = %name,
            image = %lang_config.image,
            run_secs = lang_config.timeouts.run_secs,
            "Language configured"
        );
    }

    // Probe isolation once; every run reuses the decision
    let backend = Arc::new(Backend::probe(&config, SandboxPolicy::default()).await?);
    info!(sandboxed = backend.is_sandboxed(), "Execution backend ready");

    let mut redis_conn = arena_common::config::connect_redis(&config.redis_url).await?;
    info!("Connected to Redis: {}", config.redis_url);

    let grader = Grader::new(
        Stores::redis(RedisStore::new(redis_conn.clone())),
        RunnerSet::from_config(&languages, backend),
        config.scratch_dir.clone(),
        config.lease_ttl,
    );

    // Ctrl-C stops taking new jobs; the current one finishes
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal, finishing current job...");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    worker_loop(&mut redis_conn, &grader, &config, &shutdown).await;

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip_all, fields(queue = queue::GRADING_QUEUE))]
async fn worker_loop(
    redis_conn: &mut redis::aio::ConnectionManager,
    grader: &Grader,
    config: &WorkerConfig,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        // Bounded pop so the shutdown flag is rechecked
        match queue::pop_job(redis_conn, config.poll_timeout_secs).await {
            Ok(Some(delivery)) => process(redis_conn, grader, delivery).await,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Queue error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process(redis_conn: &mut redis::aio::ConnectionManager, grader: &Grader, delivery: Delivery) {
    let job = &delivery.job;
    let job_id = job.id;
    info!(
        job_id = %job_id,
        submission_id = %job.job.submission_id,
        language = %job.job.language,
        "Received job"
    );

    if let Err(e) = queue::mark_running(redis_conn, job).await {
        warn!(job_id = %job_id, error = %e, "Failed to mark job running");
    }

    let start = std::time::Instant::now();
    let persisted = match grader.grade(&job.job).await {
        Ok(result) => {
            info!(
                job_id = %job_id,
                result = ?result,
                execution_ms = start.elapsed().as_millis() as u64,
                "Job finished"
            );
            queue::mark_finished(redis_conn, job, result).await
        }
        Err(GradeError::LeaseHeld) => {
            // duplicate delivery: the lease holder owns the record
            info!(job_id = %job_id, "Submission already being graded, dropping delivery");
            Ok(())
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Grading failed");
            queue::mark_failed(redis_conn, job, e.to_string()).await
        }
    };

    match persisted {
        Ok(()) => {
            if let Err(e) = queue::ack_job(redis_conn, &delivery).await {
                error!(job_id = %job_id, error = %e, "Failed to acknowledge job");
            }
        }
        // Left in the processing list for `arena-cli recover`
        Err(e) => error!(job_id = %job_id, error = %e, "Failed to persist job record"),
    }
}
