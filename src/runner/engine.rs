use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{LockConfig, WorkerConfig};
use crate::lock::LockRepository;
use crate::queue::{InMemoryWorkQueue, RedisWorkQueue, WorkQueue, WorkerSpout};
use crate::redis_pool::{create_redis_pool, create_redis_pool_with_config, redis_client, RedisConfig};
use crate::runner::error::WorkerError;
use crate::runner::runner::{MetricsSink, NoopMetrics, WorkerRunner};
use crate::status::{InMemoryStatusStore, RedisStatusStore, StatusStore};
use crate::unit::UnitRegistry;

/// Several runners, one per queue, sharing one queue store and one lock repository.
///
/// `start` blocks until Ctrl+C / SIGTERM, a call to [`stop`](Self::stop), or until every
/// runner has finished on its own. Either way all runners are stopped before it returns.
///
/// An engine runs once. After it has been stopped, `start` returns
/// [`WorkerError::EngineStopped`]; build a new engine to run again.
///
/// # Examples
///
/// ```rust,no_run
/// use property_runner::{FnUnit, UnitRegistry, WorkerConfig, WorkerEngine};
///
/// # async fn example() -> Result<(), property_runner::WorkerError> {
/// let registry = UnitRegistry::new().with(FnUnit::new(
///     "text-extractor",
///     |ctx| ctx.property_name_is("raw"),
///     |_| async { Ok(Vec::new()) },
/// ));
/// let engine = WorkerEngine::builder()
///     .redis_url("redis://localhost:6379")
///     .runner(WorkerConfig::new("graph-property"), registry)
///     .build()
///     .await?;
/// engine.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkerEngine {
    queue: Arc<dyn WorkQueue>,
    locks: LockRepository,
    metrics: Arc<dyn MetricsSink>,
    status_store: Option<Arc<dyn StatusStore>>,
    runners: Vec<Arc<WorkerRunner>>,
    running: Arc<RwLock<bool>>,
    cancel_token: CancellationToken,
}

impl WorkerEngine {
    pub fn new(queue: Arc<dyn WorkQueue>, locks: LockRepository) -> Self {
        Self {
            queue,
            locks,
            metrics: Arc::new(NoopMetrics),
            status_store: None,
            runners: Vec::new(),
            running: Arc::new(RwLock::new(false)),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn builder() -> WorkerEngineBuilder {
        WorkerEngineBuilder::new()
    }

    /// Metrics sink handed to runners added after this call.
    pub fn with_metrics(&mut self, sink: Arc<dyn MetricsSink>) {
        self.metrics = sink;
    }

    /// Status store handed to runners added after this call.
    pub fn with_status_store(&mut self, store: Arc<dyn StatusStore>) {
        self.status_store = Some(store);
    }

    /// Add a runner over `config.queue_name` backed by the shared store.
    pub fn add_runner(&mut self, config: WorkerConfig, registry: UnitRegistry) -> Arc<WorkerRunner> {
        let spout = WorkerSpout::new(self.queue.clone(), config.queue_name.clone());
        let mut runner = WorkerRunner::new(spout, registry, config).with_metrics(self.metrics.clone());
        if let Some(store) = &self.status_store {
            runner = runner.with_status_store(store.clone());
        }
        let runner = Arc::new(runner);
        self.runners.push(runner.clone());
        runner
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn locks(&self) -> &LockRepository {
        &self.locks
    }

    pub fn runners(&self) -> &[Arc<WorkerRunner>] {
        &self.runners
    }

    /// Run every runner until shutdown.
    ///
    /// # Returns
    ///
    /// - `Ok(())` when all runners ended cleanly.
    /// - `Err(WorkerError::AlreadyRunning)` when the engine is already started.
    /// - `Err(WorkerError::EngineStopped)` when the engine was stopped before.
    /// - The first runner error otherwise, after every runner has stopped.
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(WorkerError::AlreadyRunning);
            }
            if self.cancel_token.is_cancelled() {
                return Err(WorkerError::EngineStopped);
            }
            *running = true;
        }

        info!(
            store = self.queue.name(),
            locks = self.locks.backend_name(),
            runners = self.runners.len(),
            "Starting worker engine"
        );

        let join_handles: Vec<_> = self
            .runners
            .iter()
            .map(|runner| {
                let runner = runner.clone();
                tokio::spawn(async move { runner.run().await })
            })
            .collect();
        let all = futures::future::join_all(join_handles);
        tokio::pin!(all);

        let finished = tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, stopping worker engine");
                None
            }
            _ = self.cancel_token.cancelled() => None,
            results = &mut all => {
                info!("All runners completed");
                Some(results)
            }
        };

        self.stop().await;
        let results = match finished {
            Some(results) => results,
            None => all.await,
        };

        let mut first_error = None;
        for (runner, result) in self.runners.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(queue = %runner.queue_name(), error = %e, "Runner ended with error");
                    first_error.get_or_insert(e);
                }
                Err(e) => error!(queue = %runner.queue_name(), error = %e, "Runner task failed"),
            }
        }

        *self.running.write().await = false;
        info!("Worker engine stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Signal a graceful stop. Runners finish the item in hand first. The engine cannot be
    /// started again afterwards.
    pub async fn stop(&self) {
        info!("Stopping worker engine");
        self.cancel_token.cancel();
        for runner in &self.runners {
            runner.stop();
        }
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C signal"); },
        _ = terminate => { info!("Received SIGTERM signal"); },
    }
}

/// Builder for a [`WorkerEngine`].
///
/// Without a Redis URL the engine uses the in-memory queue and status stores, which is enough
/// for a single process and for tests. Locks come from [`LockConfig`] independently.
pub struct WorkerEngineBuilder {
    redis_url: Option<String>,
    redis_config: Option<RedisConfig>,
    key_prefix: Option<String>,
    lock_config: Option<LockConfig>,
    metrics: Option<Arc<dyn MetricsSink>>,
    report_status: bool,
    runners: Vec<(WorkerConfig, UnitRegistry)>,
}

impl WorkerEngineBuilder {
    pub fn new() -> Self {
        Self {
            redis_url: None,
            redis_config: None,
            key_prefix: None,
            lock_config: None,
            metrics: None,
            report_status: true,
            runners: Vec::new(),
        }
    }

    /// Use Redis for queues and status records.
    ///
    /// # Parameters
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub fn redis_url(mut self, url: &str) -> Self {
        self.redis_url = Some(url.to_string());
        self
    }

    pub fn redis_config(mut self, config: RedisConfig) -> Self {
        self.redis_config = Some(config);
        self
    }

    /// Prefix for every Redis key the queue and status stores write. Defaults to
    /// `property-runner`.
    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Some(prefix.to_string());
        self
    }

    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.lock_config = Some(config);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Publish runner status records. On by default.
    pub fn report_status(mut self, enabled: bool) -> Self {
        self.report_status = enabled;
        self
    }

    pub fn runner(mut self, config: WorkerConfig, registry: UnitRegistry) -> Self {
        self.runners.push((config, registry));
        self
    }

    /// Connect the stores and build every runner.
    ///
    /// # Errors
    ///
    /// `WorkerError::Redis` / `WorkerError::Config` when Redis cannot be reached or the URL is
    /// bad, `WorkerError::Lock` when the lock backend cannot be built.
    pub async fn build(self) -> Result<WorkerEngine, WorkerError> {
        let prefix = self.key_prefix.unwrap_or_else(|| "property-runner".to_string());
        let lock_config = self.lock_config.unwrap_or_default();
        let locks = LockRepository::from_config(&lock_config).await?;

        let (queue, status_store): (Arc<dyn WorkQueue>, Arc<dyn StatusStore>) = match &self.redis_url {
            Some(url) => {
                let pool = match self.redis_config {
                    Some(config) => create_redis_pool_with_config(url, config).await?,
                    None => create_redis_pool(url).await?,
                };
                let queue = RedisWorkQueue::connect(pool.clone(), redis_client(url)?, &prefix).await?;
                (Arc::new(queue), Arc::new(RedisStatusStore::new(pool, &prefix)))
            }
            None => (
                Arc::new(InMemoryWorkQueue::new()),
                Arc::new(InMemoryStatusStore::new()),
            ),
        };

        let mut engine = WorkerEngine::new(queue, locks);
        if let Some(metrics) = self.metrics {
            engine.with_metrics(metrics);
        }
        if self.report_status {
            engine.with_status_store(status_store);
        }
        for (config, registry) in self.runners {
            engine.add_runner(config, registry);
        }
        Ok(engine)
    }
}

impl Default for WorkerEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use crate::runner::runner::RunnerState;
    use crate::queue::QueueItem;
    use crate::unit::{ElementRef, FnUnit, ProcessingUnit, PropertyMessage, UnitError, UnitResult, WorkContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast(queue: &str) -> WorkerConfig {
        WorkerConfig {
            idle_backoff_base: Duration::from_millis(5),
            idle_backoff_max: Duration::from_millis(20),
            ..WorkerConfig::new(queue)
        }
    }

    fn counting(runs: Arc<AtomicUsize>) -> UnitRegistry {
        UnitRegistry::new().with(FnUnit::new("count", |_| true, move |_| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        }))
    }

    #[tokio::test]
    async fn test_engine_runs_each_queue_until_stopped() {
        crate::test_suite::init_tracing();
        let (first, second) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let engine = Arc::new(
            WorkerEngine::builder()
                .runner(fast("first"), counting(first.clone()))
                .runner(fast("second"), counting(second.clone()))
                .build()
                .await
                .unwrap(),
        );
        assert_eq!(engine.locks().backend_name(), "in_process");

        let message = PropertyMessage::for_element(ElementRef::vertex("v")).property("", "raw");
        engine.queue().push_item(message.to_item("first").unwrap()).await.unwrap();
        engine.queue().push_item(message.to_item("second").unwrap()).await.unwrap();
        engine
            .queue()
            .push("second", message.to_item("second").unwrap().payload, Priority::High)
            .await
            .unwrap();

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(engine.start().await, Err(WorkerError::AlreadyRunning)));

        engine.stop().await;
        handle.await.unwrap().unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        for runner in engine.runners() {
            assert_eq!(runner.state(), RunnerState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_stopped_engine_refuses_to_start_again() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut engine = WorkerEngine::new(Arc::new(InMemoryWorkQueue::new()), LockRepository::in_process());
        engine.add_runner(fast("q"), counting(runs.clone()));
        let engine = Arc::new(engine);

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop().await;
        handle.await.unwrap().unwrap();

        let message = PropertyMessage::for_element(ElementRef::vertex("v")).property("", "raw");
        engine.queue().push_item(message.to_item("q").unwrap()).await.unwrap();
        let again = tokio::time::timeout(Duration::from_secs(1), engine.start())
            .await
            .expect("restart should fail fast");
        assert!(matches!(again, Err(WorkerError::EngineStopped)));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(engine.queue().size_of("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_engine_returns_runner_error_after_all_finish() {
        let mut engine = WorkerEngine::new(Arc::new(InMemoryWorkQueue::new()), LockRepository::noop());
        let failing = engine.add_runner(fast("broken"), UnitRegistry::new().with(Unprepared));
        let healthy = engine.add_runner(fast("fine"), counting(Arc::new(AtomicUsize::new(0))));
        let engine = Arc::new(engine);

        tokio::spawn({
            let engine = engine.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                engine.stop().await;
            }
        });
        let result = tokio::time::timeout(Duration::from_secs(5), engine.start())
            .await
            .unwrap();

        assert!(matches!(result, Err(WorkerError::UnitPrepare(_))));
        assert_eq!(failing.state(), RunnerState::Stopped);
        assert_eq!(healthy.state(), RunnerState::Stopped);
    }

    struct Unprepared;

    #[async_trait]
    impl ProcessingUnit for Unprepared {
        fn name(&self) -> &str {
            "unprepared"
        }

        async fn prepare(&self) -> UnitResult<()> {
            Err(UnitError::Failed("no model".into()))
        }

        fn matches(&self, _ctx: &WorkContext) -> bool {
            true
        }

        async fn execute(&self, _ctx: &WorkContext) -> UnitResult<Vec<QueueItem>> {
            Ok(Vec::new())
        }
    }
}
