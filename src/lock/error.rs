use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// The lock stayed busy for the whole acquisition budget.
    #[error("Lock `{key}` not acquired within {waited:?}")]
    Timeout { key: String, waited: Duration },

    /// The coordination service could not be reached, even after the retry policy ran out.
    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("Lock backend misconfigured: {0}")]
    Misconfigured(String),

    #[error("Leadership of `{group}` lost: {reason}")]
    LeadershipLost { group: String, reason: String },

    /// A held lease could not be kept alive; another holder may already own the key.
    #[error("Lock `{key}` lost while held: {reason}")]
    Lost { key: String, reason: String },

    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// A timed-out acquisition, an unreachable service and a lease lost mid-hold all mean the
    /// lock is unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            LockError::Timeout { .. } | LockError::Unavailable(_) | LockError::Lost { .. }
        )
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            LockError::Unavailable(err.to_string())
        } else {
            LockError::Backend(err.to_string())
        }
    }
}
