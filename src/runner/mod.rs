pub mod engine;
pub mod error;
pub mod runner;

pub use engine::{WorkerEngine, WorkerEngineBuilder};
pub use error::WorkerError;
pub use runner::{ItemReport, MetricsSink, NoopMetrics, RunnerState, RunnerStatus, WorkerRunner};
