// Route table for the Arena API

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tasks/:task_id/submissions/:submission_id",
            post(handlers::enqueue_submission),
        )
        .route("/jobs/:job_id", get(handlers::get_job_status))
        .route("/status", get(handlers::health_check))
}
