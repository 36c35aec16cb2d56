// Connection settings shared by every binary

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Redis URL from `REDIS_URL`, or the local default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string())
}

/// Open a managed connection to the configured Redis
pub async fn connect_redis(url: &str) -> redis::RedisResult<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    redis::aio::ConnectionManager::new(client).await
}
