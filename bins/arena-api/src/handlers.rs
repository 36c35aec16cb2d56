// HTTP route handlers for the Arena API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use arena_common::queue;
use arena_common::store::{SubmissionStore, TestCaseStore};
use arena_common::types::{GradingJob, JobResult, JobStatus, Submission};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GradeRequest {
    pub project_id: String,
    /// Overrides the language recorded on the submission
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(serde_json::json!({ "message": text }))).into_response()
}

/// Grading payload for `submission` under `task_id`
pub fn build_job(submission: &Submission, task_id: &str, request: GradeRequest) -> GradingJob {
    GradingJob {
        submission_id: submission.id.clone(),
        task_id: task_id.to_string(),
        project_id: request.project_id,
        user_id: submission.student_id.clone(),
        language: request
            .language
            .unwrap_or_else(|| submission.language.to_string()),
        file_url: submission.file_url.clone(),
    }
}

/// POST /tasks/{task_id}/submissions/{submission_id} - Queue a submission for grading
pub async fn enqueue_submission(
    State(state): State<Arc<AppState>>,
    Path((task_id, submission_id)): Path<(String, String)>,
    Json(payload): Json<GradeRequest>,
) -> Response {
    let submission = match state.store.get_submission(&submission_id).await {
        Ok(Some(submission)) => submission,
        Ok(None) => return message(StatusCode::NOT_FOUND, "Submission doesn't exist"),
        Err(e) => {
            error!(submission_id = %submission_id, error = %e, "Failed to load submission");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load submission");
        }
    };

    match state.store.test_cases(&task_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return message(StatusCode::NOT_FOUND, "Task doesn't exist"),
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to load task");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load task");
        }
    }

    let job = build_job(&submission, &task_id, payload);

    let mut conn = state.redis.clone();
    match queue::push_job(&mut conn, job).await {
        Ok(queued) => {
            info!(
                job_id = %queued.id,
                submission_id = %submission_id,
                task_id = %task_id,
                language = %queued.job.language,
                "Grading job queued"
            );
            (
                StatusCode::ACCEPTED,
                Json(EnqueueResponse {
                    job_id: queued.id.to_string(),
                    status: JobStatus::Queued,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(submission_id = %submission_id, error = %e, "Failed to enqueue grading job");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to enqueue grading job")
        }
    }
}

/// GET /jobs/{job_id} - Job state and, once finished, its result
pub async fn get_job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_uuid = match Uuid::parse_str(&job_id) {
        Ok(id) => id,
        Err(_) => return message(StatusCode::BAD_REQUEST, "Invalid job ID format"),
    };

    let mut conn = state.redis.clone();
    match queue::get_job(&mut conn, &job_uuid).await {
        Ok(Some(record)) => {
            info!(job_id = %job_id, status = ?record.status, "Job status retrieved");
            (
                StatusCode::OK,
                Json(JobStatusResponse {
                    id: record.id,
                    status: record.status,
                    result: record.result,
                    error: record.error,
                }),
            )
                .into_response()
        }
        Ok(None) => {
            warn!(job_id = %job_id, "Unknown job");
            message(StatusCode::NOT_FOUND, "Job not found")
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to fetch job status");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to query job status")
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
