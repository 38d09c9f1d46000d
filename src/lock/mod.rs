//! Named locks and leader election.
//!
//! Three backends with different guarantees sit behind [`LockRepository`]: a no-op backend
//! (no exclusion), an in-process mutex table, and a lease-based cluster backend.

pub mod error;
pub mod lease;
pub mod leader;
pub mod local;
pub mod noop;
pub mod redis_lease;
pub mod repository;

pub use error::LockError;
pub use leader::{LeaderElection, LeaderListener};
pub use lease::{LeaseLockBackend, LeaseStore};
pub use local::InProcessLockBackend;
pub use noop::NoopLockBackend;
pub use redis_lease::RedisLeaseStore;
pub use repository::{LockBackend, LockGuard, LockRepository};
