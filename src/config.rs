use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::lock::LockError;

/// Bounded exponential backoff used for coordination-service round trips.
///
/// Attempt `n` (1-based) waits `initial_interval * 2^(n-1)` before retrying; after
/// `max_attempts` retries the last error is returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "duration_ms")]
    pub initial_interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_interval.saturating_mul(1u32 << exp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackendKind {
    /// No exclusion at all. Only for setups where a single coordinator is guaranteed externally.
    Noop,
    InProcess,
    Redis,
}

impl LockBackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "noop" | "none" => Some(Self::Noop),
            "in_process" | "in-process" | "local" | "memory" => Some(Self::InProcess),
            "redis" | "cluster" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Lock and leader-election settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub backend: LockBackendKind,
    pub redis_url: Option<String>,
    /// Prefix for every lease key written to the coordination service.
    pub base_path: String,
    pub retry: RetryPolicy,
    /// `None` waits for a busy lock forever.
    #[serde(with = "opt_duration_ms")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "duration_ms")]
    pub lease_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub election_retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::InProcess,
            redis_url: None,
            base_path: "property-runner".to_string(),
            retry: RetryPolicy::default(),
            acquire_timeout: None,
            lease_ttl: Duration::from_secs(30),
            election_retry_interval: Duration::from_secs(1),
        }
    }
}

impl LockConfig {
    /// Build the config from `LOCK_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, LockError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, LockError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("LOCK_BACKEND") {
            config.backend = LockBackendKind::parse(&raw).ok_or_else(|| {
                LockError::Misconfigured(format!("unknown LOCK_BACKEND `{raw}`"))
            })?;
        }
        config.redis_url = lookup("LOCK_REDIS_URL").filter(|url| !url.trim().is_empty());
        if let Some(base) = lookup("LOCK_BASE_PATH") {
            config.base_path = base;
        }
        if let Some(ms) = parse_ms(&lookup, "LOCK_ACQUIRE_TIMEOUT_MS")? {
            config.acquire_timeout = Some(ms);
        }
        if let Some(ms) = parse_ms(&lookup, "LOCK_LEASE_TTL_MS")? {
            config.lease_ttl = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "LOCK_RETRY_INITIAL_MS")? {
            config.retry.initial_interval = ms;
        }
        if let Some(raw) = lookup("LOCK_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = raw.trim().parse().map_err(|_| {
                LockError::Misconfigured(format!("LOCK_RETRY_MAX_ATTEMPTS is not a number: `{raw}`"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work, e.g. the Redis backend without a URL.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.backend == LockBackendKind::Redis && self.redis_url.is_none() {
            return Err(LockError::Misconfigured(
                "redis lock backend requires a redis_url".to_string(),
            ));
        }
        if self.lease_ttl < Duration::from_millis(30) {
            return Err(LockError::Misconfigured(format!(
                "lease_ttl {:?} is too short",
                self.lease_ttl
            )));
        }
        Ok(())
    }

    /// Interval at which a held lease is extended.
    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl / 3
    }
}

fn parse_ms<F>(lookup: &F, name: &str) -> Result<Option<Duration>, LockError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| LockError::Misconfigured(format!("{name} is not a number: `{raw}`"))),
    }
}

/// Runner settings for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub queue_name: String,
    /// Terminate the runner when fetching from the spout fails. Shared so that it can be
    /// flipped while the runner is alive; the runner reads it on every failure.
    #[serde(with = "shared_flag")]
    pub exit_on_fetch_failure: Arc<AtomicBool>,
    #[serde(with = "duration_ms")]
    pub fetch_failure_delay: Duration,
    #[serde(with = "duration_ms")]
    pub idle_backoff_base: Duration,
    #[serde(with = "duration_ms")]
    pub idle_backoff_max: Duration,
    #[serde(with = "duration_ms")]
    pub status_ttl: Duration,
}

impl WorkerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    pub fn exit_on_fetch_failure(&self) -> bool {
        self.exit_on_fetch_failure.load(Ordering::SeqCst)
    }

    pub fn set_exit_on_fetch_failure(&self, exit: bool) {
        self.exit_on_fetch_failure.store(exit, Ordering::SeqCst);
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "graph-property".to_string(),
            exit_on_fetch_failure: Arc::new(AtomicBool::new(true)),
            fetch_failure_delay: Duration::from_secs(10),
            idle_backoff_base: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(5),
            status_ttl: Duration::from_secs(30),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

mod shared_flag {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub fn serialize<S: Serializer>(value: &Arc<AtomicBool>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(value.load(Ordering::SeqCst))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<AtomicBool>, D::Error> {
        bool::deserialize(deserializer).map(|flag| Arc::new(AtomicBool::new(flag)))
    }
}
