use async_trait::async_trait;
use bb8_redis::bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::redis_pool::RedisPool;
use crate::runner::error::WorkerError;

/// One published status entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub group: String,
    pub instance: String,
    pub status: Value,
    pub updated_at: DateTime<Utc>,
}

/// Short-lived status records, grouped. A record disappears once its TTL passes without a
/// refresh, so a crashed process drops out of `list` on its own.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn put(&self, group: &str, instance: &str, status: Value, ttl: Duration) -> Result<(), WorkerError>;

    async fn remove(&self, group: &str, instance: &str) -> Result<(), WorkerError>;

    /// Live records of `group`, sorted by instance.
    async fn list(&self, group: &str) -> Result<Vec<StatusRecord>, WorkerError>;
}

type RecordTable = HashMap<(String, String), (StatusRecord, Instant)>;

#[derive(Default)]
pub struct InMemoryStatusStore {
    records: Mutex<RecordTable>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, RecordTable> {
        match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn put(&self, group: &str, instance: &str, status: Value, ttl: Duration) -> Result<(), WorkerError> {
        let record = StatusRecord {
            group: group.to_string(),
            instance: instance.to_string(),
            status,
            updated_at: Utc::now(),
        };
        self.records()
            .insert((group.to_string(), instance.to_string()), (record, Instant::now() + ttl));
        Ok(())
    }

    async fn remove(&self, group: &str, instance: &str) -> Result<(), WorkerError> {
        self.records().remove(&(group.to_string(), instance.to_string()));
        Ok(())
    }

    async fn list(&self, group: &str) -> Result<Vec<StatusRecord>, WorkerError> {
        let now = Instant::now();
        let mut records = self.records();
        records.retain(|_, (_, expires)| *expires > now);
        let mut live: Vec<_> = records
            .values()
            .filter(|(record, _)| record.group == group)
            .map(|(record, _)| record.clone())
            .collect();
        live.sort_by(|a, b| a.instance.cmp(&b.instance));
        Ok(live)
    }
}

/// Records stored as JSON under `{prefix}:status:{group}:{instance}` with a PX expiry.
pub struct RedisStatusStore {
    pool: RedisPool,
    prefix: String,
}

impl RedisStatusStore {
    pub fn new(pool: RedisPool, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, group: &str, instance: &str) -> String {
        format!("{}:status:{}:{}", self.prefix, group, instance)
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, WorkerError> {
        self.pool
            .get()
            .await
            .map_err(|e| WorkerError::Redis(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn put(&self, group: &str, instance: &str, status: Value, ttl: Duration) -> Result<(), WorkerError> {
        let record = StatusRecord {
            group: group.to_string(),
            instance: instance.to_string(),
            status,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_string(&record)?;
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key(group, instance))
            .arg(body)
            .arg("PX")
            .arg((ttl.as_millis() as u64).max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, group: &str, instance: &str) -> Result<(), WorkerError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(group, instance))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn list(&self, group: &str) -> Result<Vec<StatusRecord>, WorkerError> {
        let pattern = format!("{}:status:{}:*", self.prefix, group);
        let mut conn = self.conn().await?;

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // keys can expire between SCAN and MGET
        let bodies: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut *conn).await?;
        let mut records = Vec::with_capacity(bodies.len());
        for (key, body) in keys.iter().zip(bodies) {
            let Some(body) = body else { continue };
            match serde_json::from_str::<StatusRecord>(&body) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable status record"),
            }
        }
        records.sort_by(|a, b| a.instance.cmp(&b.instance));
        Ok(records)
    }
}

/// Keeps one record alive: publishes right away, then every `ttl / 3`, and removes it on
/// [`stop`](Self::stop).
pub struct StatusReporter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatusReporter {
    pub fn spawn<F>(store: Arc<dyn StatusStore>, group: &str, instance: &str, ttl: Duration, snapshot: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let group = group.to_string();
        let instance = instance.to_string();
        let every = (ttl / 3).max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = store.put(&group, &instance, snapshot(), ttl).await {
                    warn!(group = %group, instance = %instance, error = %e, "Failed to publish status");
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
            }
            if let Err(e) = store.remove(&group, &instance).await {
                warn!(group = %group, instance = %instance, error = %e, "Failed to remove status");
            }
            debug!(group = %group, instance = %instance, "Status reporter stopped");
        });

        Self { cancel, handle }
    }

    /// Stop refreshing and remove the record.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Status reporter task failed");
        }
    }
}
