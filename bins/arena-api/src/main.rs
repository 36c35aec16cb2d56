mod handlers;
mod routes;

use anyhow::Context;
use arena_common::store::RedisStore;
use axum::Router;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:3000";

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub store: RedisStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Arena API booting...");

    let redis_url = arena_common::config::redis_url();
    let redis_conn = arena_common::config::connect_redis(&redis_url)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis: {}", redis_url);

    let state = Arc::new(AppState {
        store: RedisStore::new(redis_conn.clone()),
        redis: redis_conn,
    });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    // Start server
    let addr = std::env::var("ARENA_API_ADDR").unwrap_or_else(|_| DEFAULT_API_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept grading requests");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
