//! Kernel-level error types.
//!
//! Safety outcomes (shielded / rejected events) are NOT errors: they are
//! reported as values through `GateOutcome` and `DispatchOutcome`. The errors
//! here only cover malformed input arriving at the kernel boundary.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("malformed event: {0}")]
    MalformedEvent(#[from] serde_json::Error),

    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
