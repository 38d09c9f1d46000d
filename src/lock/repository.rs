use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, warn};

use super::error::LockError;
use super::lease::{LeaseHold, LeaseLockBackend};
use super::leader::{LeaderElection, LeaderListener};
use super::local::InProcessLockBackend;
use super::noop::NoopLockBackend;
use super::redis_lease::RedisLeaseStore;
use crate::config::{LockBackendKind, LockConfig};

pub(crate) type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// A lock and leader-election provider.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Short label for logs, e.g. `"in_process"`.
    fn name(&self) -> &'static str;

    /// Wait until `key` is held by the caller.
    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError>;

    /// Enter the election for `group`. Callbacks go to `listener`.
    async fn start_leader_election(
        &self,
        group: &str,
        listener: LeaderListener,
    ) -> Result<LeaderElection, LockError>;
}

pub(crate) enum GuardInner {
    Noop,
    Local {
        guard: Option<OwnedMutexGuard<()>>,
        table: LockTable,
    },
    Lease(LeaseHold),
}

/// Proof that a named lock is held. Released by [`LockGuard::release`] or on drop.
pub struct LockGuard {
    key: String,
    inner: GuardInner,
}

impl LockGuard {
    pub(crate) fn new(key: &str, inner: GuardInner) -> Self {
        Self {
            key: key.to_string(),
            inner,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolves once the lock can no longer be trusted to exclude other holders.
    ///
    /// Only lease locks can be lost; for the other backends this never resolves.
    pub async fn lost(&self) -> LockError {
        match &self.inner {
            GuardInner::Lease(hold) => LockError::Lost {
                key: self.key.clone(),
                reason: hold.lost().await,
            },
            GuardInner::Noop | GuardInner::Local { .. } => std::future::pending().await,
        }
    }

    pub fn is_lost(&self) -> bool {
        matches!(&self.inner, GuardInner::Lease(hold) if hold.is_lost())
    }

    /// Release now and wait for the backend to confirm.
    pub async fn release(mut self) {
        if let GuardInner::Lease(hold) = &mut self.inner {
            hold.release().await;
        }
        // remaining variants release in Drop
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &mut self.inner {
            GuardInner::Noop => {}
            GuardInner::Local { guard, table } => {
                drop(guard.take());
                let mut table = match table.lock() {
                    Ok(table) => table,
                    Err(poisoned) => poisoned.into_inner(),
                };
                // Only the table itself still references the entry: nobody holds or waits.
                if table
                    .get(&self.key)
                    .is_some_and(|entry| Arc::strong_count(entry) == 1)
                {
                    table.remove(&self.key);
                }
                debug!(key = %self.key, "Released in-process lock");
            }
            GuardInner::Lease(hold) => hold.release_in_background(),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Named locks and leader election over an interchangeable backend.
///
/// # Examples
///
/// ```rust,no_run
/// use property_runner::{LockRepository, LockError};
///
/// # async fn example() -> Result<(), LockError> {
/// let locks = LockRepository::in_process();
/// let total = locks
///     .run_locked("workspace:42", || async {
///         // mutate shared state
///         Ok::<_, LockError>(42)
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LockRepository {
    backend: Arc<dyn LockBackend>,
}

impl LockRepository {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopLockBackend::new()))
    }

    pub fn in_process() -> Self {
        Self::new(Arc::new(InProcessLockBackend::new()))
    }

    /// Build the backend named by `config`. A Redis backend without a URL is an error,
    /// never a silent downgrade.
    pub async fn from_config(config: &LockConfig) -> Result<Self, LockError> {
        config.validate()?;
        let repository = match config.backend {
            LockBackendKind::Noop => Self::noop(),
            LockBackendKind::InProcess => Self::in_process(),
            LockBackendKind::Redis => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    LockError::Misconfigured("redis lock backend requires a redis_url".into())
                })?;
                let store = RedisLeaseStore::connect(url, &config.base_path, config.retry).await?;
                Self::new(Arc::new(LeaseLockBackend::new(Arc::new(store), config.clone())))
            }
        };
        debug!(backend = repository.backend.name(), "Lock repository ready");
        Ok(repository)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        self.backend.acquire(key).await
    }

    /// Run `action` while holding `key`.
    ///
    /// The lock is released on every exit path: after success, after the action returns an
    /// error (which is then passed back unchanged), and when the returned future is dropped
    /// mid-flight.
    ///
    /// If the lock is lost while the action runs (a lease that could not be renewed), the
    /// action is dropped at its next await point and [`LockError::Lost`] is returned, so it
    /// never keeps running alongside a new holder.
    pub async fn run_locked<F, Fut, T, E>(&self, key: &str, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.backend.acquire(key).await?;
        let outcome = tokio::select! {
            biased;
            lost = guard.lost() => Err(lost),
            result = action() => Ok(result),
        };
        match outcome {
            Ok(result) => {
                if result.is_err() {
                    warn!(key = %key, backend = self.backend.name(), "Locked action failed, releasing lock");
                }
                guard.release().await;
                result
            }
            Err(lost) => {
                error!(key = %key, backend = self.backend.name(), error = %lost, "Lock lost during locked action, abandoning it");
                guard.release().await;
                Err(lost.into())
            }
        }
    }

    pub async fn start_leader_election(
        &self,
        group: &str,
        listener: LeaderListener,
    ) -> Result<LeaderElection, LockError> {
        self.backend.start_leader_election(group, listener).await
    }
}

impl std::fmt::Debug for LockRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRepository")
            .field("backend", &self.backend.name())
            .finish()
    }
}
