use redis::RedisError;
use thiserror::Error;

use crate::lock::LockError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Queue fetch failed: {0}")]
    QueueFetch(String),

    #[error("Work queue error: {0}")]
    Queue(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis connection error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Worker engine has already been stopped")]
    EngineStopped,

    #[error("Processing unit prepare failed: {0}")]
    UnitPrepare(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<RedisError> for WorkerError {
    fn from(err: RedisError) -> Self {
        WorkerError::Redis(err.to_string())
    }
}

impl WorkerError {
    /// Transient failures a caller may retry after a pause.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::QueueFetch(_) | WorkerError::Queue(_) | WorkerError::Redis(_) => true,
            WorkerError::Lock(e) => e.is_unavailable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_classification() {
        assert!(WorkerError::QueueFetch("down".into()).is_retryable());
        assert!(WorkerError::Lock(LockError::Timeout {
            key: "k".into(),
            waited: Duration::from_secs(1)
        })
        .is_retryable());
        assert!(!WorkerError::Lock(LockError::Misconfigured("x".into())).is_retryable());
        assert!(!WorkerError::AlreadyRunning.is_retryable());
        assert!(!WorkerError::EngineStopped.is_retryable());
        assert!(WorkerError::Lock(LockError::Lost {
            key: "k".into(),
            reason: "lease renewal timed out".into()
        })
        .is_retryable());
        assert!(!WorkerError::UnitPrepare("bad".into()).is_retryable());
    }
}
