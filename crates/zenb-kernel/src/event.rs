//! Kernel command alphabet.
//!
//! Every state change in the runtime is driven by one of these events. The
//! same union (together with `RuntimeState`) is what the safety monitor
//! reasons over.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::KernelError;
use crate::state::{AiStatus, SafetyProfile};

/// Timestamped kernel event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelEvent {
    pub ts_ms: i64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterdictionAction {
    /// Stop now and lock the active protocol for the configured lockout
    EmergencyHalt,
    /// Lock the active protocol for an explicit duration
    Lockout { duration_sec: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    Boot,
    LoadProtocol {
        protocol_id: String,
    },
    StartSession,
    Halt {
        reason: String,
    },
    Pause,
    Resume,
    AdjustTempo {
        scale: f32,
        reason: String,
    },
    SafetyInterdiction {
        action: InterdictionAction,
    },
    ResetSafetyLock,
    LoadSafetyRegistry {
        profiles: HashMap<String, SafetyProfile>,
    },
    AiStatusChanged {
        status: AiStatus,
    },
    VoiceActivity {
        active: bool,
    },
    AiIntervention {
        kind: String,
    },
    AiInterventionEnded,
    /// Emitted by the kernel when the phase machine re-enters Inhale
    CycleComplete {
        cycle: u64,
    },
    Tick {
        dt_sec: f32,
    },
}

/// Payload-free discriminant, used by safety predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTag {
    Boot,
    LoadProtocol,
    StartSession,
    Halt,
    Pause,
    Resume,
    AdjustTempo,
    SafetyInterdiction,
    ResetSafetyLock,
    LoadSafetyRegistry,
    AiStatusChanged,
    VoiceActivity,
    AiIntervention,
    AiInterventionEnded,
    CycleComplete,
    Tick,
}

impl EventKind {
    pub fn tag(&self) -> EventTag {
        match self {
            EventKind::Boot => EventTag::Boot,
            EventKind::LoadProtocol { .. } => EventTag::LoadProtocol,
            EventKind::StartSession => EventTag::StartSession,
            EventKind::Halt { .. } => EventTag::Halt,
            EventKind::Pause => EventTag::Pause,
            EventKind::Resume => EventTag::Resume,
            EventKind::AdjustTempo { .. } => EventTag::AdjustTempo,
            EventKind::SafetyInterdiction { .. } => EventTag::SafetyInterdiction,
            EventKind::ResetSafetyLock => EventTag::ResetSafetyLock,
            EventKind::LoadSafetyRegistry { .. } => EventTag::LoadSafetyRegistry,
            EventKind::AiStatusChanged { .. } => EventTag::AiStatusChanged,
            EventKind::VoiceActivity { .. } => EventTag::VoiceActivity,
            EventKind::AiIntervention { .. } => EventTag::AiIntervention,
            EventKind::AiInterventionEnded => EventTag::AiInterventionEnded,
            EventKind::CycleComplete { .. } => EventTag::CycleComplete,
            EventKind::Tick { .. } => EventTag::Tick,
        }
    }
}

impl KernelEvent {
    pub fn new(ts_ms: i64, kind: EventKind) -> Self {
        Self { ts_ms, kind }
    }

    pub fn tag(&self) -> EventTag {
        self.kind.tag()
    }

    /// Halt and interdiction are never gated
    pub fn is_unconditional(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Halt { .. } | EventKind::SafetyInterdiction { .. }
        )
    }

    /// Parse the boundary JSON form. Anything that is not a known
    /// event shape is refused here, before it can reach `dispatch`.
    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, KernelError> {
        Ok(serde_json::to_string(self)?)
    }

    // Convenience constructors

    pub fn load_protocol(ts_ms: i64, protocol_id: impl Into<String>) -> Self {
        Self::new(
            ts_ms,
            EventKind::LoadProtocol {
                protocol_id: protocol_id.into(),
            },
        )
    }

    pub fn start_session(ts_ms: i64) -> Self {
        Self::new(ts_ms, EventKind::StartSession)
    }

    pub fn halt(ts_ms: i64, reason: impl Into<String>) -> Self {
        Self::new(
            ts_ms,
            EventKind::Halt {
                reason: reason.into(),
            },
        )
    }

    pub fn adjust_tempo(ts_ms: i64, scale: f32, reason: impl Into<String>) -> Self {
        Self::new(
            ts_ms,
            EventKind::AdjustTempo {
                scale,
                reason: reason.into(),
            },
        )
    }

    pub fn emergency_halt(ts_ms: i64) -> Self {
        Self::new(
            ts_ms,
            EventKind::SafetyInterdiction {
                action: InterdictionAction::EmergencyHalt,
            },
        )
    }
}
