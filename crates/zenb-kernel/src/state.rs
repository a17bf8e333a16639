use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::estimators::BeliefState;
use crate::observation::Observation;
use crate::phase_machine::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Idle,
    Running,
    Paused,
    Halted,
    SafetyLock,
}

impl Status {
    /// Running or Paused
    pub fn is_session_active(self) -> bool {
        matches!(self, Status::Running | Status::Paused)
    }
}

/// Voice coach link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AiStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Thinking,
    Speaking,
}

/// Per-protocol safety record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyProfile {
    pub cumulative_stress: f32,
    pub last_incident_ms: Option<i64>,
    pub lock_until_ms: Option<i64>,
    /// Mean rhythm alignment of past sessions, most recent last
    pub resonance_history: Vec<f32>,
}

impl SafetyProfile {
    pub fn is_locked(&self, now_ms: i64) -> bool {
        self.lock_until_ms.is_some_and(|until| now_ms < until)
    }

    pub fn record_resonance(&mut self, score: f32, capacity: usize) {
        if capacity == 0 {
            return;
        }
        self.resonance_history.push(score);
        if self.resonance_history.len() > capacity {
            let excess = self.resonance_history.len() - capacity;
            self.resonance_history.drain(..excess);
        }
    }

    pub fn record_incident(&mut self, now_ms: i64, stress: f32, lock_for_ms: i64) {
        self.cumulative_stress += stress;
        self.last_incident_ms = Some(now_ms);
        let until = now_ms.saturating_add(lock_for_ms);
        self.lock_until_ms = Some(self.lock_until_ms.map_or(until, |prev| prev.max(until)));
    }
}

/// Everything a subscriber sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub status: Status,
    pub protocol_id: String,
    pub tempo_scale: f32,
    pub phase: Phase,
    /// Seconds spent in the current phase
    pub phase_elapsed: f32,
    pub cycle_count: u64,
    /// Seconds of Running time in the current session
    pub session_duration: f32,
    pub belief: BeliefState,
    pub safety_registry: HashMap<String, SafetyProfile>,
    pub last_observation: Option<Observation>,
    pub ai_status: AiStatus,
    pub voice_active: bool,
    pub active_intervention: Option<String>,
    /// Logical clock
    pub now_ms: i64,
    pub lock_reason: Option<String>,
}

impl RuntimeState {
    pub fn new(protocol_id: impl Into<String>, belief: BeliefState) -> Self {
        Self {
            status: Status::Idle,
            protocol_id: protocol_id.into(),
            tempo_scale: 1.0,
            phase: Phase::Inhale,
            phase_elapsed: 0.0,
            cycle_count: 0,
            session_duration: 0.0,
            belief,
            safety_registry: HashMap::new(),
            last_observation: None,
            ai_status: AiStatus::default(),
            voice_active: false,
            active_intervention: None,
            now_ms: 0,
            lock_reason: None,
        }
    }

    pub fn is_session_active(&self) -> bool {
        self.status.is_session_active()
    }

    /// Profile of the active protocol, if one has been recorded
    pub fn active_profile(&self) -> Option<&SafetyProfile> {
        self.safety_registry.get(&self.protocol_id)
    }

    pub fn active_profile_mut(&mut self) -> &mut SafetyProfile {
        self.safety_registry
            .entry(self.protocol_id.clone())
            .or_default()
    }
}
