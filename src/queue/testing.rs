use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

use super::queue::{Priority, QueueItem, WorkQueue};
use crate::runner::error::WorkerError;

/// Wraps a store so tests can make `pop` fail on demand.
pub(crate) struct FlakyWorkQueue<Q> {
    inner: Q,
    failing: AtomicBool,
    failed_pops: AtomicUsize,
}

impl<Q: WorkQueue> FlakyWorkQueue<Q> {
    pub(crate) fn new(inner: Q) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            failed_pops: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_pops(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn failed_pops(&self) -> usize {
        self.failed_pops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<Q: WorkQueue> WorkQueue for FlakyWorkQueue<Q> {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<(), WorkerError> {
        self.inner.push(queue, payload, priority).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueueItem>, WorkerError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_pops.fetch_add(1, Ordering::SeqCst);
            return Err(WorkerError::Redis("connection reset by peer".into()));
        }
        self.inner.pop(queue).await
    }

    async fn size_of(&self, queue: &str) -> Result<usize, WorkerError> {
        self.inner.size_of(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), WorkerError> {
        self.inner.delete_queue(queue).await
    }

    async fn flush(&self) -> Result<(), WorkerError> {
        self.inner.flush().await
    }

    fn subscribe_broadcast(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.subscribe_broadcast()
    }

    async fn publish_broadcast(&self, message: Vec<u8>) -> Result<(), WorkerError> {
        self.inner.publish_broadcast(message).await
    }

    async fn wait_for_push(&self, queue: &str, max_wait: Duration) {
        self.inner.wait_for_push(queue, max_wait).await
    }
}
