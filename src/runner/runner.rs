use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::queue::{Fetch, QueueItem, WorkerSpout};
use crate::runner::error::WorkerError;
use crate::status::{StatusReporter, StatusStore};
use crate::unit::{PropertyMessage, UnitRegistry};

/// Status group under which runners publish their records.
pub const RUNNER_STATUS_GROUP: &str = "runners";

/// Optional metrics sink to expose counters without coupling to a specific backend.
///
/// Counters emitted by the runner:
/// - `item_processed`: one per dequeued item, decodable or not
/// - `item_undecodable`: payload was not a property message
/// - `unit_failed`: a unit returned an error or panicked
/// - `derived_push_failed`: a derived item could not be queued
/// - `queue_fetch_failed`: the spout reported an error
///
/// Durations: `item_processing` and `unit_execution`.
///
/// # Examples
///
/// ```rust,no_run
/// use property_runner::MetricsSink;
/// use std::time::Duration;
///
/// struct LoggingMetrics;
///
/// impl MetricsSink for LoggingMetrics {
///     fn inc_counter(&self, name: &str, value: u64) {
///         println!("METRIC: {} += {}", name, value);
///     }
///
///     fn observe_duration(&self, name: &str, duration: Duration) {
///         println!("METRIC: {} = {:?}", name, duration);
///     }
/// }
/// ```
pub trait MetricsSink: Send + Sync + 'static {
    fn inc_counter(&self, name: &str, value: u64);

    /// Record a duration metric. No-op unless overridden.
    fn observe_duration(&self, _name: &str, _dur: Duration) {
        let _ = (_name, _dur);
    }
}

/// Metrics sink that discards everything. The default.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _value: u64) {}
}

/// Simple exponential backoff helper for idle polls
struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            base,
            max,
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    fn next(&mut self) -> Duration {
        let next = self.current;
        self.current = (self.current.saturating_mul(2)).min(self.max);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Point-in-time view of a runner, also what it publishes as its status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub queue: String,
    pub state: RunnerState,
    pub items_processed: u64,
    pub unit_failures: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub units: Vec<String>,
}

#[derive(Default)]
struct RunnerStats {
    items_processed: AtomicU64,
    unit_failures: AtomicU64,
    last_processed_at: Mutex<Option<DateTime<Utc>>>,
}

impl RunnerStats {
    fn mark_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::SeqCst);
        let mut last = match self.last_processed_at.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(Utc::now());
    }

    fn snapshot(&self, queue: &str, state: RunnerState, units: Vec<String>) -> RunnerStatus {
        let last_processed_at = match self.last_processed_at.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        };
        RunnerStatus {
            queue: queue.to_string(),
            state,
            items_processed: self.items_processed.load(Ordering::SeqCst),
            unit_failures: self.unit_failures.load(Ordering::SeqCst),
            last_processed_at,
            units,
        }
    }
}

/// What happened to one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemReport {
    /// Units that completed, in execution order (repeated per element).
    pub executed: Vec<String>,
    pub failed: Vec<String>,
    /// Derived items successfully pushed.
    pub derived: usize,
    pub undecodable: bool,
}

/// Drives one spout: pulls items, hands them to interested units, queues what they derive.
///
/// A runner is shared behind an `Arc`: one task calls [`run`](Self::run), any other may call
/// [`stop`](Self::stop) or read [`status`](Self::status).
///
/// # Examples
///
/// ```rust,no_run
/// use property_runner::{FnUnit, InMemoryWorkQueue, UnitRegistry, WorkerConfig, WorkerRunner, WorkerSpout};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), property_runner::WorkerError> {
/// let store = Arc::new(InMemoryWorkQueue::new());
/// let registry = UnitRegistry::new().with(FnUnit::new(
///     "noop",
///     |ctx| ctx.property_name_is("raw"),
///     |_| async { Ok(Vec::new()) },
/// ));
/// let runner = Arc::new(WorkerRunner::new(
///     WorkerSpout::new(store, "graph-property"),
///     registry,
///     WorkerConfig::new("graph-property"),
/// ));
/// let handle = tokio::spawn({
///     let runner = runner.clone();
///     async move { runner.run().await }
/// });
/// runner.stop();
/// handle.await.ok();
/// # Ok(())
/// # }
/// ```
pub struct WorkerRunner {
    spout: WorkerSpout,
    registry: UnitRegistry,
    config: WorkerConfig,
    metrics: Arc<dyn MetricsSink>,
    status_store: Option<Arc<dyn StatusStore>>,
    state: watch::Sender<RunnerState>,
    started: AtomicBool,
    cancel: CancellationToken,
    stats: Arc<RunnerStats>,
}

impl WorkerRunner {
    pub fn new(spout: WorkerSpout, registry: UnitRegistry, config: WorkerConfig) -> Self {
        let (state, _) = watch::channel(RunnerState::Initializing);
        Self {
            spout,
            registry,
            config,
            metrics: Arc::new(NoopMetrics),
            status_store: None,
            state,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            stats: Arc::new(RunnerStats::default()),
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Publish a status record while running.
    pub fn with_status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    pub fn queue_name(&self) -> &str {
        self.spout.queue_name()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> RunnerStatus {
        self.stats
            .snapshot(self.spout.queue_name(), self.state(), self.registry.names())
    }

    /// Prepare every unit, then loop until stopped.
    ///
    /// # Returns
    ///
    /// - `Ok(())` after a requested stop.
    /// - `Err(WorkerError::UnitPrepare)` when any unit failed to prepare; nothing was pulled.
    /// - `Err(WorkerError::QueueFetch)` when the spout failed and `exit_on_fetch_failure` was set.
    /// - `Err(WorkerError::AlreadyRunning)` when `run` was called before.
    pub async fn run(&self) -> Result<(), WorkerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }
        let queue = self.spout.queue_name().to_string();
        info!(queue = %queue, units = ?self.registry.names(), "Preparing worker runner");

        if let Err(e) = self.registry.prepare_all().await {
            error!(queue = %queue, error = %e, "Worker runner failed to start");
            self.state.send_replace(RunnerState::Stopped);
            return Err(e);
        }

        let started = self.state.send_if_modified(|state| {
            if *state == RunnerState::Initializing {
                *state = RunnerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            // stop() arrived while preparing
            self.state.send_replace(RunnerState::Stopped);
            return Ok(());
        }
        info!(queue = %queue, "Worker runner started");

        let reporter = self.status_store.clone().map(|store| self.spawn_reporter(store));
        let result = self.work_loop(&queue).await;

        if let Some(reporter) = reporter {
            reporter.stop().await;
        }
        self.state.send_replace(RunnerState::Stopped);
        info!(queue = %queue, items_processed = self.stats.items_processed.load(Ordering::SeqCst), "Worker runner stopped");
        result
    }

    async fn work_loop(&self, queue: &str) -> Result<(), WorkerError> {
        let mut backoff = Backoff::new(self.config.idle_backoff_base, self.config.idle_backoff_max);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.spout.next().await {
                Ok(Fetch::Item(item)) => {
                    backoff.reset();
                    self.process_item(item).await;
                }
                Ok(Fetch::Empty) => {
                    let sleep_for = backoff.next();
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = self.spout.wait_for_work(sleep_for) => {}
                    }
                }
                Err(e) => {
                    self.metrics.inc_counter("queue_fetch_failed", 1);
                    if self.config.exit_on_fetch_failure() {
                        error!(queue = %queue, error = %e, "Failed to fetch next item, terminating runner");
                        return Err(e);
                    }
                    warn!(
                        queue = %queue,
                        error = %e,
                        retry_in = ?self.config.fetch_failure_delay,
                        "Failed to fetch next item, continuing"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.fetch_failure_delay) => {}
                    }
                }
            }
        }
    }

    /// One dispatch cycle: pull once and process what came back.
    ///
    /// Returns `Ok(None)` when the queue was empty.
    pub async fn process_next(&self) -> Result<Option<ItemReport>, WorkerError> {
        match self.spout.next().await {
            Ok(Fetch::Item(item)) => Ok(Some(self.process_item(item).await)),
            Ok(Fetch::Empty) => Ok(None),
            Err(e) => {
                self.metrics.inc_counter("queue_fetch_failed", 1);
                Err(e)
            }
        }
    }

    /// Run every interested unit on `item`. Unit failures are logged and counted, never
    /// returned; the item is consumed either way.
    pub async fn process_item(&self, item: QueueItem) -> ItemReport {
        let started = Instant::now();
        let queue = item.queue_name.clone();
        let mut report = ItemReport::default();

        let message = match PropertyMessage::from_slice(&item.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Dropping undecodable item");
                self.metrics.inc_counter("item_undecodable", 1);
                report.undecodable = true;
                self.finish_item(started);
                return report;
            }
        };

        for ctx in message.contexts() {
            let units = self.registry.interested(&message, &ctx);
            if units.is_empty() {
                debug!(queue = %queue, element = %ctx.element.id, property = ?ctx.property_name, "No unit interested");
                continue;
            }

            for unit in units {
                let unit_started = Instant::now();
                let outcome = AssertUnwindSafe(unit.execute(&ctx)).catch_unwind().await;
                self.metrics
                    .observe_duration("unit_execution", unit_started.elapsed());

                let derived = match outcome {
                    Ok(Ok(derived)) => derived,
                    Ok(Err(e)) => {
                        self.record_failure(unit.name(), &ctx.element.id, &e.to_string(), &mut report);
                        continue;
                    }
                    Err(_panic) => {
                        self.record_failure(unit.name(), &ctx.element.id, "unit panicked", &mut report);
                        continue;
                    }
                };

                debug!(
                    queue = %queue,
                    unit = %unit.name(),
                    element = %ctx.element.id,
                    derived = derived.len(),
                    "Processing unit completed"
                );
                report.executed.push(unit.name().to_string());
                for next in derived {
                    let target = next.queue_name.clone();
                    match self.spout.store().push_item(next).await {
                        Ok(()) => report.derived += 1,
                        Err(e) => {
                            self.metrics.inc_counter("derived_push_failed", 1);
                            error!(queue = %target, unit = %unit.name(), error = %e, "Failed to queue derived item");
                        }
                    }
                }
            }
        }

        self.finish_item(started);
        report
    }

    fn record_failure(&self, unit: &str, element: &str, reason: &str, report: &mut ItemReport) {
        self.stats.unit_failures.fetch_add(1, Ordering::SeqCst);
        self.metrics.inc_counter("unit_failed", 1);
        error!(
            queue = %self.spout.queue_name(),
            unit = %unit,
            element = %element,
            reason = %reason,
            "ProcessingUnitFailure"
        );
        report.failed.push(unit.to_string());
    }

    fn finish_item(&self, started: Instant) {
        self.stats.mark_processed();
        self.metrics.inc_counter("item_processed", 1);
        self.metrics.observe_duration("item_processing", started.elapsed());
    }

    /// Ask the loop to exit. An item in flight is finished first.
    pub fn stop(&self) {
        self.state.send_if_modified(|state| match state {
            RunnerState::Initializing | RunnerState::Running => {
                *state = RunnerState::Stopping;
                true
            }
            _ => false,
        });
        self.cancel.cancel();
        debug!(queue = %self.spout.queue_name(), "Worker runner stop requested");
    }

    fn spawn_reporter(&self, store: Arc<dyn StatusStore>) -> StatusReporter {
        let instance = format!("{}-{}", self.spout.queue_name(), Uuid::new_v4());
        let stats = self.stats.clone();
        let queue = self.spout.queue_name().to_string();
        let units = self.registry.names();
        let state = self.state.subscribe();
        StatusReporter::spawn(store, RUNNER_STATUS_GROUP, &instance, self.config.status_ttl, move || {
            let status = stats.snapshot(&queue, *state.borrow(), units.clone());
            serde_json::to_value(status).unwrap_or_default()
        })
    }
}

impl std::fmt::Debug for WorkerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("queue", &self.spout.queue_name())
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::testing::FlakyWorkQueue;
    use crate::queue::{InMemoryWorkQueue, Priority, WorkQueue};
    use crate::status::InMemoryStatusStore;
    use crate::unit::{ElementRef, ElementStatus, FnUnit, ProcessingUnit, UnitError, UnitResult, WorkContext};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const QUEUE: &str = "graph-property";

    #[derive(Default)]
    struct CountingMetrics {
        processed: AtomicU64,
        failed: AtomicU64,
        fetch_failed: AtomicU64,
    }

    impl MetricsSink for CountingMetrics {
        fn inc_counter(&self, name: &str, value: u64) {
            match name {
                "item_processed" => self.processed.fetch_add(value, Ordering::SeqCst),
                "unit_failed" => self.failed.fetch_add(value, Ordering::SeqCst),
                "queue_fetch_failed" => self.fetch_failed.fetch_add(value, Ordering::SeqCst),
                _ => 0,
            };
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            idle_backoff_base: Duration::from_millis(5),
            idle_backoff_max: Duration::from_millis(20),
            fetch_failure_delay: Duration::from_millis(20),
            ..WorkerConfig::new(QUEUE)
        }
    }

    fn raw_item(element: &str) -> QueueItem {
        PropertyMessage::for_element(ElementRef::vertex(element))
            .property("k", "raw")
            .value("raw", json!(format!("content of {element}")))
            .to_item(QUEUE)
            .unwrap()
    }

    fn counting_unit(name: &'static str, runs: Arc<AtomicUsize>) -> FnUnit {
        FnUnit::new(name, |ctx| ctx.property_name_is("raw"), move |_| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        })
    }

    #[tokio::test]
    async fn test_raw_unit_runs_once_and_derived_item_lands_in_target_queue() {
        crate::test_suite::init_tracing();
        let store = Arc::new(InMemoryWorkQueue::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let unit = FnUnit::new("text-extractor", |ctx| ctx.property_name_is("raw"), move |ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let text = ctx.property_value().cloned().unwrap_or_default();
                let derived = ctx
                    .derive()
                    .property("k", "text")
                    .value("text", text)
                    .to_item("text-index")?;
                Ok::<_, UnitError>(vec![derived])
            }
        });
        let runner = WorkerRunner::new(
            WorkerSpout::new(store.clone(), QUEUE),
            UnitRegistry::new().with(unit),
            fast_config(),
        );

        store.push_item(raw_item("v1")).await.unwrap();
        let report = runner.process_next().await.unwrap().unwrap();
        assert_eq!(report.executed, vec!["text-extractor"]);
        assert_eq!(report.derived, 1);
        assert_eq!(runner.process_next().await.unwrap(), None);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let derived = store.pop("text-index").await.unwrap().unwrap();
        let message = PropertyMessage::from_slice(&derived.payload).unwrap();
        assert_eq!(message.elements, vec![ElementRef::vertex("v1")]);
        assert_eq!(message.property_name.as_deref(), Some("text"));
        assert_eq!(message.properties["text"], json!("content of v1"));
    }

    #[tokio::test]
    async fn test_failing_unit_does_not_stop_other_items() {
        let store = Arc::new(InMemoryWorkQueue::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let unit = FnUnit::new("picky", |_| true, move |ctx: WorkContext| {
            let log = log.clone();
            async move {
                if ctx.element.id == "x" {
                    return Err(UnitError::Failed("cannot parse".into()));
                }
                log.lock().unwrap().push(ctx.element.id.clone());
                Ok(Vec::new())
            }
        });
        let metrics = Arc::new(CountingMetrics::default());
        let runner = WorkerRunner::new(
            WorkerSpout::new(store.clone(), QUEUE),
            UnitRegistry::new().with(unit),
            fast_config(),
        )
        .with_metrics(metrics.clone());

        for element in ["x", "y", "z"] {
            store.push_item(raw_item(element)).await.unwrap();
        }
        while runner.process_next().await.unwrap().is_some() {}

        assert_eq!(*seen.lock().unwrap(), vec!["y", "z"]);
        assert_eq!(metrics.failed.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.processed.load(Ordering::SeqCst), 3);
        let status = runner.status();
        assert_eq!(status.items_processed, 3);
        assert_eq!(status.unit_failures, 1);
        assert!(status.last_processed_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_finishes_item_in_flight_and_pulls_no_more() {
        let store = Arc::new(InMemoryWorkQueue::new());
        let (entered, release) = (Arc::new(tokio::sync::Notify::new()), Arc::new(tokio::sync::Notify::new()));
        let finished = Arc::new(AtomicUsize::new(0));
        let unit = FnUnit::new("slow", |_| true, {
            let (entered, release, finished) = (entered.clone(), release.clone(), finished.clone());
            move |_| {
                let (entered, release, finished) = (entered.clone(), release.clone(), finished.clone());
                async move {
                    entered.notify_one();
                    release.notified().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
            }
        });
        let runner = Arc::new(WorkerRunner::new(
            WorkerSpout::new(store.clone(), QUEUE),
            UnitRegistry::new().with(unit),
            fast_config(),
        ));
        store.push_item(raw_item("first")).await.unwrap();
        store.push_item(raw_item("second")).await.unwrap();

        let handle = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run().await }
        });
        tokio::time::timeout(Duration::from_secs(5), entered.notified())
            .await
            .expect("unit never started");
        runner.stop();
        assert_eq!(runner.state(), RunnerState::Stopping);
        release.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runner did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(store.size_of(QUEUE).await.unwrap(), 1);
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(runner.status().items_processed, 1);
    }

    struct Panicky;

    #[async_trait]
    impl ProcessingUnit for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn matches(&self, _ctx: &WorkContext) -> bool {
            true
        }

        async fn execute(&self, _ctx: &WorkContext) -> UnitResult<Vec<QueueItem>> {
            panic!("bug in unit");
        }
    }

    #[tokio::test]
    async fn test_panicking_unit_is_counted_and_next_unit_runs() {
        let store = Arc::new(InMemoryWorkQueue::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let runner = WorkerRunner::new(
            WorkerSpout::new(store.clone(), QUEUE),
            UnitRegistry::new()
                .with(Panicky)
                .with(counting_unit("after", runs.clone())),
            fast_config(),
        );
        store.push_item(raw_item("v")).await.unwrap();
        let report = runner.process_next().await.unwrap().unwrap();
        assert_eq!(report.failed, vec!["panicky"]);
        assert_eq!(report.executed, vec!["after"]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecodable_item_is_consumed() {
        let store = Arc::new(InMemoryWorkQueue::new());
        let runner = WorkerRunner::new(
            WorkerSpout::new(store.clone(), QUEUE),
            UnitRegistry::new(),
            fast_config(),
        );
        store.push(QUEUE, b"\x00garbage".to_vec(), Priority::Normal).await.unwrap();
        let report = runner.process_next().await.unwrap().unwrap();
        assert!(report.undecodable);
        assert_eq!(store.size_of(QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_routing_and_lists() {
        let store = Arc::new(InMemoryWorkQueue::new());
        let (updates, deletes, listed) = (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let registry = UnitRegistry::new()
            .with(counting_unit("updates", updates.clone()))
            .with(counting_unit("deletes", deletes.clone()).on_statuses(&[ElementStatus::Deletion]))
            .with(counting_unit("listed", listed.clone()));
        let runner = WorkerRunner::new(WorkerSpout::new(store.clone(), QUEUE), registry, fast_config());

        let base = PropertyMessage::for_element(ElementRef::vertex("v")).property("k", "raw");
        for message in [
            base.clone(),
            base.clone().status(ElementStatus::Deletion),
            base.clone().status(ElementStatus::Hidden),
            base.clone().blacklist(["listed"]),
        ] {
            store.push_item(message.to_item(QUEUE).unwrap()).await.unwrap();
        }
        while runner.process_next().await.unwrap().is_some() {}

        assert_eq!(updates.load(Ordering::SeqCst), 2);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        assert_eq!(listed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_terminates_when_flag_set() {
        let store = Arc::new(FlakyWorkQueue::new(InMemoryWorkQueue::new()));
        store.fail_pops(true);
        let metrics = Arc::new(CountingMetrics::default());
        let runner = WorkerRunner::new(WorkerSpout::new(store, QUEUE), UnitRegistry::new(), fast_config())
            .with_metrics(metrics.clone());

        let result = tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .expect("runner should terminate on its own");
        assert!(matches!(result, Err(WorkerError::QueueFetch(_))));
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(metrics.fetch_failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_continues_when_flag_cleared_at_runtime() {
        let store = Arc::new(FlakyWorkQueue::new(InMemoryWorkQueue::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        let config = fast_config();
        let runner = Arc::new(WorkerRunner::new(
            WorkerSpout::new(store.clone(), QUEUE),
            UnitRegistry::new().with(counting_unit("raw", runs.clone())),
            config.clone(),
        ));
        // the runner shares the flag with the caller's config
        config.set_exit_on_fetch_failure(false);
        store.fail_pops(true);

        let handle = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.failed_pops() >= 2);
        assert_eq!(runner.state(), RunnerState::Running);

        store.fail_pops(false);
        store.push_item(raw_item("v")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        runner.stop();
        handle.await.unwrap().unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    struct Unprepared;

    #[async_trait]
    impl ProcessingUnit for Unprepared {
        fn name(&self) -> &str {
            "unprepared"
        }

        async fn prepare(&self) -> UnitResult<()> {
            Err(UnitError::InvalidInput("missing model".into()))
        }

        fn matches(&self, _ctx: &WorkContext) -> bool {
            true
        }

        async fn execute(&self, _ctx: &WorkContext) -> UnitResult<Vec<QueueItem>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_prepare_failure_aborts_start() {
        let store = Arc::new(InMemoryWorkQueue::new());
        store.push_item(raw_item("v")).await.unwrap();
        let runner = WorkerRunner::new(
            WorkerSpout::new(store.clone(), QUEUE),
            UnitRegistry::new().with(Unprepared),
            fast_config(),
        );
        let result = runner.run().await;
        assert!(matches!(result, Err(WorkerError::UnitPrepare(_))));
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(store.size_of(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_state_transitions_and_second_run_rejected() {
        let store = Arc::new(InMemoryWorkQueue::new());
        let runner = Arc::new(WorkerRunner::new(
            WorkerSpout::new(store, QUEUE),
            UnitRegistry::new(),
            fast_config(),
        ));
        let mut states = runner.subscribe_state();
        assert_eq!(runner.state(), RunnerState::Initializing);

        let handle = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run().await }
        });
        states.wait_for(|s| *s == RunnerState::Running).await.unwrap();
        assert!(matches!(runner.run().await, Err(WorkerError::AlreadyRunning)));

        runner.stop();
        handle.await.unwrap().unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_running_runner_publishes_status_record() {
        let store = Arc::new(InMemoryWorkQueue::new());
        let statuses = Arc::new(InMemoryStatusStore::new());
        let runner = Arc::new(
            WorkerRunner::new(WorkerSpout::new(store, QUEUE), UnitRegistry::new(), fast_config())
                .with_status_store(statuses.clone()),
        );
        let handle = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = statuses.list(RUNNER_STATUS_GROUP).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status["queue"], json!(QUEUE));
        assert_eq!(records[0].status["state"], json!("running"));

        runner.stop();
        handle.await.unwrap().unwrap();
        assert!(statuses.list(RUNNER_STATUS_GROUP).await.unwrap().is_empty());
    }

    #[test]
    fn test_backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let waits: Vec<_> = (0..8).map(|_| backoff.next()).collect();
        assert_eq!(waits[0], Duration::from_millis(100));
        assert_eq!(waits[1], Duration::from_millis(200));
        assert_eq!(waits[6], Duration::from_secs(5));
        assert_eq!(waits[7], Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
