use thiserror::Error;

use crate::lock::LockError;
use crate::runner::error::WorkerError;

/// Failure reported by a processing unit. The runner logs and counts it, then moves on.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("Processing failed: {0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<WorkerError> for UnitError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Serialization(e) => UnitError::Json(e),
            WorkerError::Lock(e) => UnitError::Lock(e),
            other => UnitError::Failed(other.to_string()),
        }
    }
}

/// Result type for unit handlers that want the `?` operator.
pub type UnitResult<T> = Result<T, UnitError>;
