use std::sync::Arc;
use tracing::{error, info};

use super::message::{PropertyMessage, WorkContext};
use super::unit::{accepts, ProcessingUnit};
use crate::runner::error::WorkerError;

/// Processing units in registration order. Fixed once a runner starts.
#[derive(Clone, Default)]
pub struct UnitRegistry {
    units: Vec<Arc<dyn ProcessingUnit>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, unit: impl ProcessingUnit + 'static) -> &mut Self {
        self.register_arc(Arc::new(unit))
    }

    pub fn register_arc(&mut self, unit: Arc<dyn ProcessingUnit>) -> &mut Self {
        info!(unit = %unit.name(), "Registered processing unit");
        self.units.push(unit);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, unit: impl ProcessingUnit + 'static) -> Self {
        self.register(unit);
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.name().to_string()).collect()
    }

    /// Run every unit's `prepare` hook. All units are attempted; any failure fails the whole
    /// call with the names of the units that broke.
    pub async fn prepare_all(&self) -> Result<(), WorkerError> {
        let mut failed = Vec::new();
        for unit in &self.units {
            if let Err(e) = unit.prepare().await {
                error!(unit = %unit.name(), error = %e, "Processing unit failed to prepare");
                failed.push(format!("{}: {}", unit.name(), e));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(WorkerError::UnitPrepare(failed.join("; ")))
        }
    }

    /// Units that want `ctx`, in registration order.
    pub fn interested(&self, message: &PropertyMessage, ctx: &WorkContext) -> Vec<Arc<dyn ProcessingUnit>> {
        self.units
            .iter()
            .filter(|unit| message.allows_unit(unit.name()) && accepts(unit.as_ref(), ctx))
            .cloned()
            .collect()
    }

    /// Whether pushing `message` would lead to any work. Producers use this to skip dead items.
    pub fn can_handle(&self, message: &PropertyMessage) -> bool {
        message
            .contexts()
            .iter()
            .any(|ctx| !self.interested(message, ctx).is_empty())
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.names())
            .finish()
    }
}
