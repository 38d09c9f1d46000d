use async_trait::async_trait;
use bb8_redis::bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use futures::StreamExt;
use redis::aio::PubSub;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{Priority, QueueItem, WorkQueue};
use crate::config::RetryPolicy;
use crate::redis_pool::{retry_async, RedisPool};
use crate::runner::error::WorkerError;

const BROADCAST_CAPACITY: usize = 256;
const RESUBSCRIBE_PAUSE: Duration = Duration::from_secs(5);

/// Pops the head of the high list, falling back to the normal list, in one round trip.
const POP_SCRIPT: &str = r#"
local item = redis.call('LPOP', KEYS[1])
if item then
    return item
end
return redis.call('LPOP', KEYS[2])
"#;

/// Redis-backed queue store.
///
/// Each named queue is two lists, `{prefix}:queue:{name}:high` and `{prefix}:queue:{name}:normal`.
/// `High` items are appended to the first, `Normal` and `Low` to the second, so FIFO holds
/// inside each class and `High` always drains first. Stored values carry a one-byte priority
/// tag ahead of the payload.
///
/// Broadcasts travel over Redis PUBLISH/SUBSCRIBE on `{prefix}:broadcast`; a background
/// subscriber forwards them into a local channel that [`WorkQueue::subscribe_broadcast`]
/// hands out. If the subscription connection drops, the subscriber reconnects and
/// resubscribes until the store is dropped; broadcasts published while it is away are missed.
pub struct RedisWorkQueue {
    pool: RedisPool,
    prefix: String,
    pop: Script,
    broadcast: broadcast::Sender<Vec<u8>>,
    listener: CancellationToken,
}

impl RedisWorkQueue {
    /// Build the store and start the broadcast subscriber.
    pub async fn connect(pool: RedisPool, client: redis::Client, prefix: &str) -> Result<Self, WorkerError> {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        let listener = CancellationToken::new();
        let channel = format!("{prefix}:broadcast");

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        info!(channel = %channel, "Subscribed to queue broadcasts");

        tokio::spawn(forward_broadcasts(
            client,
            channel,
            pubsub,
            broadcast.clone(),
            listener.clone(),
        ));

        Ok(Self {
            pool,
            prefix: prefix.to_string(),
            pop: Script::new(POP_SCRIPT),
            broadcast,
            listener,
        })
    }

    fn high_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:high", self.prefix, queue)
    }

    fn normal_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:normal", self.prefix, queue)
    }

    fn broadcast_channel(&self) -> String {
        format!("{}:broadcast", self.prefix)
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, WorkerError> {
        self.pool
            .get()
            .await
            .map_err(|e| WorkerError::Queue(format!("Failed to get Redis connection: {}", e)))
    }
}

/// Forward subscription messages into the local channel, resubscribing whenever the
/// connection ends, until `stop` fires.
async fn forward_broadcasts(
    client: redis::Client,
    channel: String,
    mut pubsub: PubSub,
    forward: broadcast::Sender<Vec<u8>>,
    stop: CancellationToken,
) {
    'subscription: loop {
        {
            let mut messages = Box::pin(pubsub.on_message());
            loop {
                let message = tokio::select! {
                    _ = stop.cancelled() => break 'subscription,
                    message = messages.next() => message,
                };
                let Some(message) = message else {
                    break;
                };
                match message.get_payload::<Vec<u8>>() {
                    Ok(payload) => {
                        let _ = forward.send(payload);
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Unreadable broadcast payload"),
                }
            }
        }

        warn!(channel = %channel, "Broadcast subscription closed, reconnecting");
        pubsub = tokio::select! {
            _ = stop.cancelled() => break 'subscription,
            resubscribed = resubscribe(&client, &channel) => resubscribed,
        };
        info!(channel = %channel, "Resubscribed to queue broadcasts");
    }
    debug!(channel = %channel, "Broadcast subscriber stopped");
}

async fn resubscribe(client: &redis::Client, channel: &str) -> PubSub {
    let policy = RetryPolicy::default();
    loop {
        let attempt = retry_async(&policy, || async move {
            let mut pubsub = client.get_async_pubsub().await?;
            pubsub.subscribe(channel).await?;
            Ok::<_, redis::RedisError>(pubsub)
        })
        .await;
        match attempt {
            Ok(pubsub) => return pubsub,
            Err(e) => {
                error!(channel = %channel, error = %e, "Broadcast resubscription failed, will keep trying");
                tokio::time::sleep(RESUBSCRIBE_PAUSE).await;
            }
        }
    }
}

impl Drop for RedisWorkQueue {
    fn drop(&mut self) {
        self.listener.cancel();
    }
}

fn encode(payload: Vec<u8>, priority: Priority) -> Vec<u8> {
    let mut stored = Vec::with_capacity(payload.len() + 1);
    stored.push(priority.tag());
    stored.extend(payload);
    stored
}

fn decode(queue: &str, stored: Vec<u8>) -> Result<QueueItem, WorkerError> {
    let (tag, payload) = stored
        .split_first()
        .ok_or_else(|| WorkerError::Queue(format!("empty entry in queue `{queue}`")))?;
    let priority = Priority::from_tag(*tag)
        .ok_or_else(|| WorkerError::Queue(format!("unknown priority tag {tag:#x} in queue `{queue}`")))?;
    Ok(QueueItem::new(queue, payload.to_vec(), priority))
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<(), WorkerError> {
        let key = match priority {
            Priority::High => self.high_key(queue),
            Priority::Normal | Priority::Low => self.normal_key(queue),
        };
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(&key, encode(payload, priority)).await?;
        debug!(queue = %queue, priority = ?priority, "Item pushed");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueueItem>, WorkerError> {
        let mut conn = self.conn().await?;
        let stored: Option<Vec<u8>> = self
            .pop
            .key(self.high_key(queue))
            .key(self.normal_key(queue))
            .invoke_async(&mut *conn)
            .await?;
        stored.map(|stored| decode(queue, stored)).transpose()
    }

    async fn size_of(&self, queue: &str) -> Result<usize, WorkerError> {
        let mut conn = self.conn().await?;
        let high: usize = conn.llen(self.high_key(queue)).await?;
        let normal: usize = conn.llen(self.normal_key(queue)).await?;
        Ok(high + normal)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), WorkerError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(vec![self.high_key(queue), self.normal_key(queue)])
            .await?;
        debug!(queue = %queue, "Queue deleted");
        Ok(())
    }

    async fn flush(&self) -> Result<(), WorkerError> {
        // every push is acknowledged by the server before it returns
        Ok(())
    }

    fn subscribe_broadcast(&self) -> broadcast::Receiver<Vec<u8>> {
        self.broadcast.subscribe()
    }

    async fn publish_broadcast(&self, message: Vec<u8>) -> Result<(), WorkerError> {
        let mut conn = self.conn().await?;
        let receivers: i64 = conn.publish(self.broadcast_channel(), message).await?;
        debug!(receivers, "Broadcast published");
        Ok(())
    }

    async fn wait_for_push(&self, _queue: &str, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}
