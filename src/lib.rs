//! Property-Runner: priority work queues, worker dispatch, named locks and leader election for
//! graph-property processing.
//!
//! This crate moves graph-property change events from producers to a pool of pluggable
//! processing units, with support for:
//! - Named priority queues (`High` items served before `Normal`/`Low`, FIFO within each)
//! - In-memory and Redis queue stores with a broadcast side channel
//! - Runners that match items to units, run them and queue the derived work
//! - Named locks and per-group leader election over no-op, in-process or Redis lease backends
//! - Ephemeral runner status records
//! - Graceful shutdown handling
//!
//! # Example
//!
//! ```rust,no_run
//! use property_runner::{
//!     ElementRef, FnUnit, LeaderListener, LockConfig, PropertyMessage, UnitError,
//!     UnitRegistry, WorkerConfig, WorkerEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Turn raw content into a text property on the same element
//!     let registry = UnitRegistry::new().with(FnUnit::new(
//!         "text-extractor",
//!         |ctx| ctx.property_name_is("raw"),
//!         |ctx| async move {
//!             let text = ctx.property_value().cloned().unwrap_or_default();
//!             let derived = ctx
//!                 .derive()
//!                 .property("", "text")
//!                 .value("text", text)
//!                 .to_item("graph-property")?;
//!             Ok::<_, UnitError>(vec![derived])
//!         },
//!     ));
//!
//!     let engine = WorkerEngine::builder()
//!         .redis_url("redis://127.0.0.1:6379")
//!         .lock_config(LockConfig::from_env()?)
//!         .runner(WorkerConfig::new("graph-property"), registry)
//!         .build()
//!         .await?;
//!
//!     // Producers push property messages
//!     let message = PropertyMessage::for_element(ElementRef::vertex("v1"))
//!         .property("", "raw")
//!         .value("raw", serde_json::json!("hello"));
//!     engine.queue().push_item(message.to_item("graph-property")?).await?;
//!
//!     // One process in the cluster runs the nightly cleanup
//!     let _election = engine
//!         .locks()
//!         .start_leader_election(
//!             "cleanup",
//!             LeaderListener::task(|cancel| async move {
//!                 cancel.cancelled().await;
//!             }),
//!         )
//!         .await?;
//!
//!     // Runs until Ctrl+C / SIGTERM
//!     engine.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod lock;
pub mod queue;
pub mod redis_pool;
pub mod runner;
pub mod status;
pub mod unit;

#[cfg(test)]
mod test_suite;

// Re-export main types for easy access
pub use crate::config::{LockBackendKind, LockConfig, RetryPolicy, WorkerConfig};
pub use crate::lock::{
    InProcessLockBackend, LeaderElection, LeaderListener, LeaseLockBackend, LeaseStore, LockBackend,
    LockError, LockGuard, LockRepository, NoopLockBackend, RedisLeaseStore,
};
pub use crate::queue::{Fetch, InMemoryWorkQueue, Priority, QueueItem, RedisWorkQueue, WorkQueue, WorkerSpout};
pub use crate::redis_pool::{create_redis_pool, create_redis_pool_with_config, RedisConfig, RedisPool};
pub use crate::runner::{
    ItemReport, MetricsSink, NoopMetrics, RunnerState, RunnerStatus, WorkerEngine, WorkerEngineBuilder,
    WorkerError, WorkerRunner,
};
pub use crate::status::{InMemoryStatusStore, RedisStatusStore, StatusRecord, StatusReporter, StatusStore};
pub use crate::unit::{
    ElementKind, ElementRef, ElementStatus, FnUnit, ProcessingUnit, PropertyMessage, UnitError,
    UnitRegistry, UnitResult, WorkContext,
};
