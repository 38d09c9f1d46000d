use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use super::error::LockError;
use super::leader::{LeaderElection, LeaderEvent, LeaderListener};
use super::repository::{GuardInner, LockBackend, LockGuard};

/// Backend that provides no exclusion at all.
///
/// Every `acquire` succeeds immediately and every contender is elected leader. This is only
/// correct when something outside the process already guarantees a single coordinator, e.g.
/// a local development setup with one worker.
#[derive(Debug, Default)]
pub struct NoopLockBackend {
    warned: AtomicBool,
}

impl NoopLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("No-op lock backend in use: locks and leader election are not enforced");
        }
    }
}

#[async_trait]
impl LockBackend for NoopLockBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        self.warn_once();
        debug!(key = %key, "No-op lock granted");
        Ok(LockGuard::new(key, GuardInner::Noop))
    }

    async fn start_leader_election(
        &self,
        group: &str,
        listener: LeaderListener,
    ) -> Result<LeaderElection, LockError> {
        self.warn_once();
        Ok(LeaderElection::spawn(group, listener, |events, cancel| async move {
            let _ = events.send(LeaderEvent::Elected);
            cancel.cancelled().await;
            let _ = events.send(LeaderEvent::Deposed);
        }))
    }
}
