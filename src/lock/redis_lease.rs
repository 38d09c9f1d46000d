use async_trait::async_trait;
use bb8_redis::bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::info;

use super::error::LockError;
use super::lease::LeaseStore;
use crate::config::RetryPolicy;
use crate::redis_pool::{create_redis_pool_with_config, redacted, RedisConfig, RedisPool};
use crate::runner::WorkerError;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Leases stored as plain Redis keys with a PX expiry, valued by the holder token.
///
/// Keys are namespaced as `{base_path}:lock:{key}` and `{base_path}:leader:{group}`.
pub struct RedisLeaseStore {
    pool: RedisPool,
    base_path: String,
    renew: Script,
    release: Script,
}

impl RedisLeaseStore {
    /// Connect and verify the server with a PING, retrying per `retry`.
    pub async fn connect(url: &str, base_path: &str, retry: RetryPolicy) -> Result<Self, LockError> {
        let config = RedisConfig {
            max_size: 8,
            min_idle: 1,
            retry,
            ..RedisConfig::default()
        };
        let pool = create_redis_pool_with_config(url, config).await.map_err(|e| match e {
            WorkerError::Config(message) => LockError::Misconfigured(message),
            other => LockError::Unavailable(other.to_string()),
        })?;
        info!(url = %redacted(url), base_path = %base_path, "Redis lease store connected");
        Ok(Self::with_pool(pool, base_path))
    }

    pub fn with_pool(pool: RedisPool, base_path: &str) -> Self {
        Self {
            pool,
            base_path: base_path.to_string(),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.base_path, key)
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, LockError> {
        self.pool
            .get()
            .await
            .map_err(|e| LockError::Unavailable(format!("Failed to get Redis connection: {}", e)))
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(set.is_some())
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn().await?;
        let renewed: i64 = self
            .renew
            .key(self.namespaced(key))
            .arg(holder)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut *conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .release
            .key(self.namespaced(key))
            .arg(holder)
            .invoke_async(&mut *conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn current_holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn().await?;
        let holder: Option<String> = conn.get(self.namespaced(key)).await?;
        Ok(holder)
    }
}
