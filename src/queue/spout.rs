use std::sync::Arc;
use std::time::Duration;

use super::queue::{QueueItem, WorkQueue};
use crate::runner::error::WorkerError;

/// Result of one pull from a spout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    Item(QueueItem),
    Empty,
}

/// Pull adapter over one named queue. No retries or backoff happen here; that is the
/// runner's business.
#[derive(Clone)]
pub struct WorkerSpout {
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
}

impl WorkerSpout {
    pub fn new(queue: Arc<dyn WorkQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn store(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub async fn next(&self) -> Result<Fetch, WorkerError> {
        match self.queue.pop(&self.queue_name).await {
            Ok(Some(item)) => Ok(Fetch::Item(item)),
            Ok(None) => Ok(Fetch::Empty),
            Err(e) => Err(WorkerError::QueueFetch(format!(
                "{} queue `{}`: {}",
                self.queue.name(),
                self.queue_name,
                e
            ))),
        }
    }

    pub(crate) async fn wait_for_work(&self, max_wait: Duration) {
        self.queue.wait_for_push(&self.queue_name, max_wait).await
    }
}

impl std::fmt::Debug for WorkerSpout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpout")
            .field("store", &self.queue.name())
            .field("queue", &self.queue_name)
            .finish()
    }
}
