//! State estimators for the belief engine.

pub mod ukf;

pub use ukf::{
    BeliefState, ChannelOutcome, EstimatorDiagnostics, TargetState, UkfConfig, UkfStateEstimator,
};
