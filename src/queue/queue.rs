use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::runner::error::WorkerError;

/// Scheduling class of a queued item.
///
/// `High` items jump ahead of everything that is not `High`; `Normal` and `Low` are both
/// served in arrival order behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Priority::High => b'H',
            Priority::Normal => b'N',
            Priority::Low => b'L',
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'H' => Some(Priority::High),
            b'N' => Some(Priority::Normal),
            b'L' => Some(Priority::Low),
            _ => None,
        }
    }
}

/// One unit of work in a named queue. The payload is opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub queue_name: String,
    pub priority: Priority,
    pub payload: Vec<u8>,
}

impl QueueItem {
    pub fn new(queue_name: impl Into<String>, payload: Vec<u8>, priority: Priority) -> Self {
        Self {
            queue_name: queue_name.into(),
            priority,
            payload,
        }
    }

    /// Serialize `value` as the JSON payload of a new item.
    pub fn json<T: Serialize>(
        queue_name: impl Into<String>,
        value: &T,
        priority: Priority,
    ) -> Result<Self, WorkerError> {
        Ok(Self::new(queue_name, serde_json::to_vec(value)?, priority))
    }
}

/// Storage for named priority queues plus a process-wide broadcast channel.
///
/// A popped item belongs to exactly one caller; if that caller crashes the item is gone.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Short label for logs, e.g. `"memory"`.
    fn name(&self) -> &'static str;

    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<(), WorkerError>;

    async fn push_item(&self, item: QueueItem) -> Result<(), WorkerError> {
        self.push(&item.queue_name, item.payload, item.priority).await
    }

    /// Take the next item without waiting. `None` for a drained or unknown queue.
    async fn pop(&self, queue: &str) -> Result<Option<QueueItem>, WorkerError>;

    async fn size_of(&self, queue: &str) -> Result<usize, WorkerError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), WorkerError>;

    /// Make every accepted push visible to other consumers before returning.
    async fn flush(&self) -> Result<(), WorkerError>;

    fn subscribe_broadcast(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Deliver `message` to the receivers subscribed right now. Having none is fine.
    async fn publish_broadcast(&self, message: Vec<u8>) -> Result<(), WorkerError>;

    /// Sleep for at most `max_wait`, returning early if the store can tell that `queue` got an
    /// item in the meantime.
    async fn wait_for_push(&self, queue: &str, max_wait: Duration);
}
