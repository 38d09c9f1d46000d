use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

use super::queue::{Priority, QueueItem, WorkQueue};
use crate::runner::error::WorkerError;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    /// Number of `High` items; they always occupy the front of `items`.
    high: usize,
    pushed: Arc<Notify>,
}

/// Process-local queue store. Each instance owns its queues; nothing is global.
pub struct InMemoryWorkQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    /// Woken on every push; waited on for queues that do not exist yet.
    any_pushed: Notify,
    broadcast: broadcast::Sender<Vec<u8>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            queues: Mutex::new(HashMap::new()),
            any_pushed: Notify::new(),
            broadcast,
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<(), WorkerError> {
        let notify = {
            let mut queues = self.queues();
            let state = queues.entry(queue.to_string()).or_default();
            let item = QueueItem::new(queue, payload, priority);
            if priority == Priority::High {
                state.items.insert(state.high, item);
                state.high += 1;
            } else {
                state.items.push_back(item);
            }
            state.pushed.clone()
        };
        notify.notify_waiters();
        self.any_pushed.notify_waiters();
        debug!(queue = %queue, priority = ?priority, "Item pushed");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueueItem>, WorkerError> {
        let mut queues = self.queues();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let item = state.items.pop_front();
        if item.as_ref().is_some_and(|i| i.priority == Priority::High) {
            state.high -= 1;
        }
        Ok(item)
    }

    async fn size_of(&self, queue: &str) -> Result<usize, WorkerError> {
        Ok(self.queues().get(queue).map_or(0, |s| s.items.len()))
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), WorkerError> {
        if let Some(state) = self.queues().remove(queue) {
            state.pushed.notify_waiters();
            debug!(queue = %queue, dropped = state.items.len(), "Queue deleted");
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), WorkerError> {
        // pushes are applied synchronously
        Ok(())
    }

    fn subscribe_broadcast(&self) -> broadcast::Receiver<Vec<u8>> {
        self.broadcast.subscribe()
    }

    async fn publish_broadcast(&self, message: Vec<u8>) -> Result<(), WorkerError> {
        let receivers = self.broadcast.send(message).unwrap_or(0);
        debug!(receivers, "Broadcast published");
        Ok(())
    }

    async fn wait_for_push(&self, queue: &str, max_wait: Duration) {
        // waiting must not create the queue, or polling arbitrary names would grow the map
        let notify = self.queues().get(queue).map(|state| state.pushed.clone());
        match notify {
            Some(notify) => {
                let _ = tokio::time::timeout(max_wait, notify.notified()).await;
            }
            None => {
                let _ = tokio::time::timeout(max_wait, self.any_pushed.notified()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn payloads(items: Vec<Option<QueueItem>>) -> Vec<Vec<u8>> {
        items.into_iter().flatten().map(|i| i.payload).collect()
    }

    #[tokio::test]
    async fn test_high_priority_jumps_ahead_of_normal() {
        let queue = InMemoryWorkQueue::new();
        queue.push("q", b"A".to_vec(), Priority::Normal).await.unwrap();
        queue.push("q", b"B".to_vec(), Priority::High).await.unwrap();
        queue.push("q", b"C".to_vec(), Priority::Normal).await.unwrap();

        let mut popped = Vec::new();
        for _ in 0..3 {
            popped.push(queue.pop("q").await.unwrap());
        }
        assert_eq!(
            payloads(popped),
            vec![b"B".to_vec(), b"A".to_vec(), b"C".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_each_priority() {
        let queue = InMemoryWorkQueue::new();
        for (payload, priority) in [
            ("n1", Priority::Normal),
            ("h1", Priority::High),
            ("l1", Priority::Low),
            ("h2", Priority::High),
            ("n2", Priority::Normal),
        ] {
            queue.push("q", payload.as_bytes().to_vec(), priority).await.unwrap();
        }
        assert_eq!(queue.size_of("q").await.unwrap(), 5);

        let mut order = Vec::new();
        while let Some(item) = queue.pop("q").await.unwrap() {
            order.push(String::from_utf8(item.payload).unwrap());
        }
        assert_eq!(order, vec!["h1", "h2", "n1", "l1", "n2"]);

        // head region stays consistent after draining
        queue.push("q", b"n3".to_vec(), Priority::Normal).await.unwrap();
        queue.push("q", b"h3".to_vec(), Priority::High).await.unwrap();
        assert_eq!(queue.pop("q").await.unwrap().unwrap().payload, b"h3".to_vec());
    }

    #[tokio::test]
    async fn test_empty_and_unknown_queues_pop_none() {
        let queue = InMemoryWorkQueue::new();
        for _ in 0..5 {
            assert_eq!(queue.pop("missing").await.unwrap(), None);
        }
        queue.push("q", b"x".to_vec(), Priority::Low).await.unwrap();
        assert!(queue.pop("q").await.unwrap().is_some());
        assert_eq!(queue.pop("q").await.unwrap(), None);
        assert_eq!(queue.pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_queue_drops_items() {
        let queue = InMemoryWorkQueue::new();
        queue.push("q", b"x".to_vec(), Priority::Normal).await.unwrap();
        queue.push("other", b"y".to_vec(), Priority::Normal).await.unwrap();
        queue.delete_queue("q").await.unwrap();
        queue.flush().await.unwrap();
        assert_eq!(queue.size_of("q").await.unwrap(), 0);
        assert_eq!(queue.size_of("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_current_subscribers_only() {
        let queue = InMemoryWorkQueue::new();
        // nobody listening yet: not an error
        queue.publish_broadcast(b"early".to_vec()).await.unwrap();

        let mut first = queue.subscribe_broadcast();
        let mut second = queue.subscribe_broadcast();
        queue.publish_broadcast(b"hello".to_vec()).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(second.recv().await.unwrap(), b"hello".to_vec());
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_for_push_wakes_early() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let pusher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push("q", b"x".to_vec(), Priority::Normal).await.unwrap();
        });

        let started = Instant::now();
        queue.wait_for_push("q", Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(queue.size_of("q").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_on_unknown_queues_creates_nothing() {
        let queue = InMemoryWorkQueue::new();
        for i in 0..100 {
            queue
                .wait_for_push(&format!("never-pushed-{i}"), Duration::from_millis(1))
                .await;
            assert_eq!(queue.pop(&format!("never-pushed-{i}")).await.unwrap(), None);
        }
        assert!(queue.queues().is_empty());

        queue.push("q", b"x".to_vec(), Priority::Normal).await.unwrap();
        queue.wait_for_push("other", Duration::from_millis(1)).await;
        assert_eq!(queue.queues().len(), 1);
    }
}
