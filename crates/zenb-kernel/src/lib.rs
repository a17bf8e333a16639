//! ZenB runtime kernel: breath phase machine, UKF belief estimator and an
//! LTL safety monitor that gates every state-changing command.
//!
//! # Export surface
//! Curated re-exports only. The kernel entry point is [`RuntimeKernel`];
//! everything a driver needs to feed it (events, observations, config) is
//! re-exported here.

// These lints are allowed on purpose:
// - needless_range_loop: sigma-point loops index several arrays at once
// - manual_clamp: min/max chains kept where they read closer to the math
// - new_without_default: kernel construction is fallible
#![allow(clippy::needless_range_loop)]
#![allow(clippy::manual_clamp)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod controller; // PID tempo loop + protocol recommender
pub mod driver;
pub mod error;
pub mod estimators; // UKF belief estimator
pub mod event;
pub mod kernel;
pub mod observation;
pub mod phase_machine;
pub mod protocol;
pub mod safety; // LTL monitor + shield
pub mod state;

pub use config::{ConfigError, KernelConfig, RuntimeConfig, SafetyConfig};
pub use controller::{
    create_tempo_controller, PatternRecommender, PidConfig, PidController, Recommendation,
    TempoController, TempoControllerConfig, TimeOfDay,
};
pub use driver::FixedStepDriver;
pub use error::KernelError;
pub use estimators::{BeliefState, EstimatorDiagnostics, UkfConfig, UkfStateEstimator};
pub use event::{EventKind, EventTag, InterdictionAction, KernelEvent};
pub use kernel::{
    DispatchOutcome, FollowUps, Middleware, RuntimeKernel, SessionSummary, Subscription,
};
pub use observation::{HeartRateReading, Observation};
pub use phase_machine::{Phase, PhaseDurations, PhaseMachine};
pub use protocol::{ArousalCategory, BreathProtocol, PhaseTimings, ProtocolTable};
pub use safety::{GateOutcome, SafetyMonitor, SafetyViolation, Severity};
pub use state::{AiStatus, RuntimeState, SafetyProfile, Status};

#[cfg(test)]
pub mod tests_estimator;
#[cfg(test)]
pub mod tests_proptest;
#[cfg(test)]
pub mod tests_scenarios;
