pub mod error;
pub mod message;
pub mod registry;
pub mod unit;

pub use error::{UnitError, UnitResult};
pub use message::{ElementKind, ElementRef, ElementStatus, PropertyMessage, WorkContext};
pub use registry::UnitRegistry;
pub use unit::{FnUnit, ProcessingUnit};
