//! Safety Monitor module
//!
//! LTL runtime verification and shielding of kernel events

pub mod catalog;
pub mod formula;
pub mod monitor;
pub mod shield;

pub use catalog::{standard_catalog, PropertyClass, SafetyProperty};
pub use formula::{EvalContext, EventHistory, Formula, Predicate};
pub use monitor::{GateOutcome, SafetyMonitor, SafetyViolation, Severity};
pub use shield::{shield_tempo, Correctable, ShieldContext};
