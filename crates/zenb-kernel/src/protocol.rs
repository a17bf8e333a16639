//! Breathing Protocol Registry
//!
//! Static table of the breathing protocols the kernel can pace.
//!
//! # Protocols Available
//! - **4-7-8**: Relaxing breath (sleep & anxiety)
//! - **calm**: Extended exhale for everyday relaxation
//! - **7-11**: Anti-anxiety
//! - **deep-relax**: Deep parasympathetic activation
//! - **box**: Focus under pressure
//! - **coherence**: 5-second HRV rhythm
//! - **triangle**: Three-phase meditation pattern
//! - **tactical**: High-stress performance
//! - **awake**: Alertness boost
//! - **buteyko**: CO2 tolerance training
//! - **wim-hof**: Controlled hyperventilation (prep phase)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::KernelError;
use crate::phase_machine::PhaseDurations;

/// Arousal impact magnitude below which a protocol counts as balanced
pub const BALANCED_IMPACT_BAND: f32 = 0.5;

/// Phase timings in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub inhale: f32,
    pub hold_in: f32,
    pub exhale: f32,
    pub hold_out: f32,
}

impl PhaseTimings {
    /// Convert to PhaseDurations (microseconds)
    pub fn to_phase_durations(&self) -> PhaseDurations {
        PhaseDurations {
            inhale_us: secs_to_us(self.inhale),
            hold_in_us: secs_to_us(self.hold_in),
            exhale_us: secs_to_us(self.exhale),
            hold_out_us: secs_to_us(self.hold_out),
        }
    }

    /// Total cycle duration in seconds
    pub fn total_seconds(&self) -> f32 {
        self.inhale + self.hold_in + self.exhale + self.hold_out
    }
}

fn secs_to_us(sec: f32) -> u64 {
    if sec.is_finite() && sec > 0.0 {
        (sec as f64 * 1_000_000.0).round() as u64
    } else {
        0
    }
}

/// Physiological direction a protocol pushes the user in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArousalCategory {
    Parasympathetic,
    Balanced,
    Sympathetic,
}

impl ArousalCategory {
    pub fn from_impact(arousal_impact: f32) -> Self {
        if arousal_impact < -BALANCED_IMPACT_BAND {
            ArousalCategory::Parasympathetic
        } else if arousal_impact > BALANCED_IMPACT_BAND {
            ArousalCategory::Sympathetic
        } else {
            ArousalCategory::Balanced
        }
    }
}

/// Breathing protocol definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreathProtocol {
    /// Unique protocol identifier
    pub id: String,
    /// Display label
    pub label: String,
    /// Description of the protocol
    pub description: String,
    /// Phase timings in seconds
    pub timings: PhaseTimings,
    /// Recommended number of cycles
    pub recommended_cycles: u32,
    /// Arousal impact: -1.0 (sedative) to 1.0 (stimulant)
    pub arousal_impact: f32,
}

impl BreathProtocol {
    pub fn to_phase_durations(&self) -> PhaseDurations {
        self.timings.to_phase_durations()
    }

    /// Breaths per minute at nominal tempo
    pub fn breaths_per_minute(&self) -> f32 {
        let total = self.timings.total_seconds();
        if total > 0.0 {
            60.0 / total
        } else {
            0.0
        }
    }

    pub fn category(&self) -> ArousalCategory {
        ArousalCategory::from_impact(self.arousal_impact)
    }
}

fn protocol(
    id: &str,
    label: &str,
    description: &str,
    (inhale, hold_in, exhale, hold_out): (f32, f32, f32, f32),
    recommended_cycles: u32,
    arousal_impact: f32,
) -> BreathProtocol {
    BreathProtocol {
        id: id.to_string(),
        label: label.to_string(),
        description: description.to_string(),
        timings: PhaseTimings {
            inhale,
            hold_in,
            exhale,
            hold_out,
        },
        recommended_cycles,
        arousal_impact,
    }
}

/// Immutable id → protocol lookup
#[derive(Debug, Clone)]
pub struct ProtocolTable {
    protocols: BTreeMap<String, BreathProtocol>,
}

impl ProtocolTable {
    /// Table with every built-in protocol
    pub fn builtin() -> Self {
        let protocols = [
            // Calming (parasympathetic)
            protocol(
                "4-7-8",
                "Relaxing Breath",
                "A natural tranquilizer for the nervous system.",
                (4.0, 7.0, 8.0, 0.0),
                4,
                -0.8,
            ),
            protocol(
                "calm",
                "Calm Wave",
                "Gentle, extended exhale for everyday relaxation.",
                (4.0, 0.0, 6.0, 0.0),
                10,
                -0.5,
            ),
            protocol(
                "7-11",
                "7-11 Anti-Anxiety",
                "Long exhale technique for acute anxiety relief.",
                (7.0, 0.0, 11.0, 0.0),
                6,
                -0.9,
            ),
            protocol(
                "deep-relax",
                "Deep Relaxation",
                "Extended hold and exhale for deep parasympathetic activation.",
                (4.0, 7.0, 10.0, 0.0),
                5,
                -0.95,
            ),
            // Focus (balanced)
            protocol(
                "box",
                "Box Breathing",
                "Four equal sides to steady attention under pressure.",
                (4.0, 4.0, 4.0, 4.0),
                10,
                0.0,
            ),
            protocol(
                "coherence",
                "Heart Coherence",
                "Five-second rhythm for heart rate variability.",
                (5.0, 0.0, 5.0, 0.0),
                12,
                -0.2,
            ),
            protocol(
                "triangle",
                "Triangle Breath",
                "Balanced three-phase pattern for meditation.",
                (4.0, 4.0, 4.0, 0.0),
                8,
                -0.1,
            ),
            protocol(
                "tactical",
                "Tactical Breathing",
                "Combat breathing for high-stress performance.",
                (4.0, 4.0, 4.0, 4.0),
                6,
                0.1,
            ),
            // Energizing (sympathetic)
            protocol(
                "awake",
                "Energizing Breath",
                "Quick inhale, short exhale for an alertness boost.",
                (2.0, 0.0, 2.0, 0.0),
                15,
                0.6,
            ),
            // Advanced
            protocol(
                "buteyko",
                "Buteyko Method",
                "Reduced breathing with CO2 tolerance training.",
                (3.0, 0.0, 3.0, 5.0),
                8,
                -0.3,
            ),
            protocol(
                "wim-hof",
                "Wim Hof Method",
                "Controlled hyperventilation, preparation rounds only.",
                (2.0, 0.0, 2.0, 0.0),
                30,
                0.8,
            ),
        ];

        Self {
            protocols: protocols.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&BreathProtocol> {
        self.protocols.get(id)
    }

    /// Like `get`, for call sites that propagate malformed-input errors
    pub fn require(&self, id: &str) -> Result<&BreathProtocol, KernelError> {
        self.get(id)
            .ok_or_else(|| KernelError::UnknownProtocol(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.protocols.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BreathProtocol> {
        self.protocols.values()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

impl Default for ProtocolTable {
    fn default() -> Self {
        Self::builtin()
    }
}
