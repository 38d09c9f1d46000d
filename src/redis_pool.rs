use bb8_redis::bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::RetryPolicy;
use crate::runner::error::WorkerError;

pub type RedisPool = Pool<RedisConnectionManager>;

/// Configuration for Redis connection pool
#[derive(Debug, Clone, Copy)]
pub struct RedisConfig {
    pub max_size: u32,
    pub min_idle: u32,
    pub conn_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub retry: RetryPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            min_idle: 5,
            conn_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            retry: RetryPolicy {
                initial_interval: Duration::from_millis(400),
                max_attempts: 3,
            },
        }
    }
}

/// Build a pool and verify it with a PING (with retry/backoff).
pub async fn create_redis_pool(redis_url: &str) -> Result<RedisPool, WorkerError> {
    create_redis_pool_with_config(redis_url, RedisConfig::default()).await
}

/// Build a pool with custom configuration and verify it with a PING (with retry/backoff).
pub async fn create_redis_pool_with_config(
    redis_url: &str,
    config: RedisConfig,
) -> Result<RedisPool, WorkerError> {
    tracing::info!(
        url = %redacted(redis_url),
        "Redis pool: max_size={}, min_idle={}, timeouts: conn={}s idle={}s life={}s",
        config.max_size,
        config.min_idle,
        config.conn_timeout.as_secs(),
        config.idle_timeout.as_secs(),
        config.max_lifetime.as_secs()
    );

    if config.max_size == 0 {
        return Err(WorkerError::Config("redis max_size must be > 0".into()));
    }
    let manager = RedisConnectionManager::new(redis_url).map_err(|e| {
        WorkerError::Config(format!("invalid redis url: {} - {}", redacted(redis_url), e))
    })?;

    let min_idle = config.min_idle.max(1).min(config.max_size);
    let pool = Pool::builder()
        .max_size(config.max_size)
        .min_idle(Some(min_idle))
        .connection_timeout(config.conn_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .max_lifetime(Some(config.max_lifetime))
        .build(manager)
        .await
        .map_err(|e| WorkerError::Redis(format!("failed to build Redis pool: {}", e)))?;

    retry_async(&config.retry, || async {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| WorkerError::Redis(format!("get() from pool: {}", e)))?;
        redis_ping(&mut conn).await
    })
    .await
    .map_err(|e| {
        WorkerError::Redis(format!(
            "unable to verify Redis connectivity after retries: {}",
            e
        ))
    })?;

    Ok(pool)
}

/// Plain client for connections a pool cannot hand out, such as pub/sub subscriptions.
pub fn redis_client(redis_url: &str) -> Result<redis::Client, WorkerError> {
    redis::Client::open(redis_url)
        .map_err(|e| WorkerError::Config(format!("invalid redis url: {} - {}", redacted(redis_url), e)))
}

async fn redis_ping(
    conn: &mut PooledConnection<'_, RedisConnectionManager>,
) -> Result<(), WorkerError> {
    let _: String = redis::cmd("PING")
        .query_async(&mut **conn)
        .await
        .map_err(|e| WorkerError::Redis(format!("Redis PING failed: {}", e)))?;
    Ok(())
}

/// Generic async retry with exponential backoff driven by a [`RetryPolicy`].
pub(crate) async fn retry_async<F, Fut, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "Retry {}/{} after error: {e:#}. Sleeping {:?}",
                    attempt,
                    policy.max_attempts,
                    delay
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Redact credentials in logs
pub(crate) fn redacted(url: &str) -> String {
    // very light redaction for URIs like: redis://:password@host:6379/db
    if let Some(idx) = url.find('@') {
        let head = &url[..idx];
        if let Some(scheme_end) = head.find("://") {
            let scheme_end = scheme_end + 3;
            return format!("{}***:***{}", &url[..scheme_end], &url[idx..]);
        }
    }
    url.to_string()
}
