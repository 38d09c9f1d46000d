use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::LockError;
use super::leader::{LeaderElection, LeaderEvent, LeaderListener};
use super::repository::{GuardInner, LockBackend, LockGuard};
use crate::config::LockConfig;
use crate::redis_pool::retry_async;

const BUSY_POLL_MIN: Duration = Duration::from_millis(10);
const BUSY_POLL_MAX: Duration = Duration::from_millis(500);

/// Expiring, holder-tagged claims on keys in a coordination service.
///
/// Every mutating call compares the holder token first, so a client whose lease expired can
/// never extend or delete somebody else's claim.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    fn name(&self) -> &'static str {
        "lease"
    }

    /// Claim `key` for `holder` if nobody holds it. `Ok(false)` means busy.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Push the expiry out by `ttl`. `Ok(false)` means the claim is no longer ours.
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Drop the claim if it is still ours.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError>;

    async fn current_holder(&self, key: &str) -> Result<Option<String>, LockError>;
}

/// Cluster-wide locks and leader election on top of a [`LeaseStore`].
pub struct LeaseLockBackend {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
}

impl LeaseLockBackend {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    fn claim_lease(&self, key: &str, token: String) -> LeaseHold {
        let renewal = CancellationToken::new();
        let lost = CancellationToken::new();
        let lost_reason = Arc::new(OnceLock::new());
        tokio::spawn(renew_lock_lease(
            self.store.clone(),
            LeaseRenewal {
                key: key.to_string(),
                token: token.clone(),
                ttl: self.config.lease_ttl,
                every: self.config.renew_interval(),
            },
            renewal.clone(),
            lost.clone(),
            lost_reason.clone(),
        ));
        LeaseHold {
            store: self.store.clone(),
            key: key.to_string(),
            token,
            renewal,
            lost,
            lost_reason,
            released: false,
        }
    }
}

#[async_trait]
impl LockBackend for LeaseLockBackend {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let lease_key = format!("lock:{key}");
        let token = Uuid::new_v4().to_string();
        let ttl = self.config.lease_ttl;
        let started = Instant::now();
        let mut poll = BUSY_POLL_MIN;

        loop {
            let claimed = retry_async(&self.config.retry, || {
                self.store.try_acquire(&lease_key, &token, ttl)
            })
            .await
            .map_err(|e| {
                error!(key = %key, error = %e, "Lock acquisition failed after retries");
                e
            })?;

            if claimed {
                debug!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "Acquired lease lock");
                let hold = self.claim_lease(&lease_key, token);
                return Ok(LockGuard::new(key, GuardInner::Lease(hold)));
            }

            let waited = started.elapsed();
            let mut pause = poll;
            if let Some(limit) = self.config.acquire_timeout {
                if waited >= limit {
                    warn!(key = %key, waited_ms = waited.as_millis() as u64, "Lock acquisition timed out");
                    return Err(LockError::Timeout {
                        key: key.to_string(),
                        waited,
                    });
                }
                pause = pause.min(limit - waited);
            }
            sleep(pause).await;
            poll = (poll * 2).min(BUSY_POLL_MAX);
        }
    }

    async fn start_leader_election(
        &self,
        group: &str,
        listener: LeaderListener,
    ) -> Result<LeaderElection, LockError> {
        let store = self.store.clone();
        let config = self.config.clone();
        let group_name = group.to_string();
        Ok(LeaderElection::spawn(group, listener, move |events, cancel| {
            contend(store, config, group_name, events, cancel)
        }))
    }
}

/// A claimed lock lease plus its renewal task.
pub(crate) struct LeaseHold {
    store: Arc<dyn LeaseStore>,
    key: String,
    token: String,
    renewal: CancellationToken,
    /// Cancelled by the renewal task once the lease can no longer be trusted.
    lost: CancellationToken,
    lost_reason: Arc<OnceLock<String>>,
    released: bool,
}

impl LeaseHold {
    pub(crate) async fn lost(&self) -> String {
        self.lost.cancelled().await;
        self.lost_reason()
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    fn lost_reason(&self) -> String {
        self.lost_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "lease renewal stopped".to_string())
    }

    pub(crate) async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.renewal.cancel();
        log_release(&self.key, self.store.release(&self.key, &self.token).await);
    }

    /// Release from a synchronous context (drop). Needs a runtime; otherwise the lease simply
    /// runs out.
    pub(crate) fn release_in_background(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.renewal.cancel();

        let (store, key, token) = (self.store.clone(), self.key.clone(), self.token.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    log_release(&key, store.release(&key, &token).await);
                });
            }
            Err(_) => warn!(key = %key, "No runtime to release lease; it will expire"),
        }
    }
}

fn log_release(key: &str, outcome: Result<bool, LockError>) {
    match outcome {
        Ok(true) => debug!(key = %key, "Released lease lock"),
        Ok(false) => warn!(key = %key, "Lease had already expired when released"),
        Err(e) => warn!(key = %key, error = %e, "Failed to release lease; it will expire"),
    }
}

struct LeaseRenewal {
    key: String,
    token: String,
    ttl: Duration,
    every: Duration,
}

/// Keeps a lock lease alive. Declares it lost when the store says it is no longer ours, or
/// when no renewal has succeeded for `ttl - every`, which is before the lease itself can lapse.
async fn renew_lock_lease(
    store: Arc<dyn LeaseStore>,
    lease: LeaseRenewal,
    cancel: CancellationToken,
    lost: CancellationToken,
    lost_reason: Arc<OnceLock<String>>,
) {
    let LeaseRenewal { key, token, ttl, every } = lease;
    let deadline = ttl.saturating_sub(every);
    let retry_every = (every / 4).max(Duration::from_millis(1));
    let mut renewed_at = Instant::now();
    let mut pause = every;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep(pause) => {}
        }

        let remaining = (renewed_at + deadline).saturating_duration_since(Instant::now());
        let outcome = if remaining.is_zero() {
            None
        } else {
            tokio::time::timeout(remaining.min(every), store.renew(&key, &token, ttl))
                .await
                .ok()
        };
        let (reason, definitive) = match outcome {
            Some(Ok(true)) => {
                renewed_at = Instant::now();
                pause = every;
                continue;
            }
            Some(Ok(false)) => ("lease claimed by another holder".to_string(), true),
            Some(Err(e)) => (e.to_string(), false),
            None => ("lease renewal timed out".to_string(), false),
        };

        if !definitive && renewed_at.elapsed() < deadline {
            warn!(key = %key, error = %reason, "Lock lease renewal failed, retrying");
            pause = retry_every;
            continue;
        }
        if cancel.is_cancelled() {
            return;
        }
        error!(key = %key, reason = %reason, "Lock lease lost while held");
        let _ = lost_reason.set(reason);
        lost.cancel();
        return;
    }
}

/// Contention loop for one election participant.
async fn contend(
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    group: String,
    events: tokio::sync::mpsc::UnboundedSender<LeaderEvent>,
    cancel: CancellationToken,
) {
    let key = format!("leader:{group}");
    let token = Uuid::new_v4().to_string();
    let ttl = config.lease_ttl;
    let renew_every = config.renew_interval();
    let mut leading = false;
    // set when a renewal failed without proof that the claim is gone
    let mut stale_claim = false;

    loop {
        if leading {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(renew_every) => {}
            }
            let lost = match tokio::time::timeout(renew_every, store.renew(&key, &token, ttl)).await {
                Ok(Ok(true)) => None,
                Ok(Ok(false)) => Some(("lease claimed by another contender".to_string(), false)),
                Ok(Err(e)) => Some((e.to_string(), true)),
                Err(_) => Some(("lease renewal timed out".to_string(), true)),
            };
            if let Some((reason, maybe_ours)) = lost {
                let err = LockError::LeadershipLost {
                    group: group.clone(),
                    reason,
                };
                warn!(group = %group, error = %err, "Deposing local leader");
                leading = false;
                stale_claim = maybe_ours;
                let _ = events.send(LeaderEvent::Deposed);
            }
            continue;
        }

        if stale_claim {
            // a renewal that timed out may still have landed, leaving our own token on the key
            match store.current_holder(&key).await {
                Ok(Some(holder)) if holder == token => match store.release(&key, &token).await {
                    Ok(_) => {
                        debug!(group = %group, "Dropped own stale leader lease");
                        stale_claim = false;
                    }
                    Err(e) => debug!(group = %group, error = %e, "Stale leader lease not dropped yet"),
                },
                Ok(_) => stale_claim = false,
                Err(e) => debug!(group = %group, error = %e, "Stale leader lease not checked yet"),
            }
        }

        match store.try_acquire(&key, &token, ttl).await {
            Ok(true) => {
                info!(group = %group, holder = %token, "Won leader lease");
                leading = true;
                let _ = events.send(LeaderEvent::Elected);
                continue;
            }
            Ok(false) => {}
            Err(e) => debug!(group = %group, error = %e, "Leader lease claim failed"),
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(config.election_retry_interval) => {}
        }
    }

    if leading {
        let _ = events.send(LeaderEvent::Deposed);
        if let Err(e) = store.release(&key, &token).await {
            warn!(group = %group, error = %e, "Failed to release leader lease; it will expire");
        }
    }
    debug!(group = %group, "Left leader election");
}
