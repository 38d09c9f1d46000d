pub mod memory;
pub mod queue;
pub mod redis_queue;
pub mod spout;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::InMemoryWorkQueue;
pub use queue::{Priority, QueueItem, WorkQueue};
pub use redis_queue::RedisWorkQueue;
pub use spout::{Fetch, WorkerSpout};
