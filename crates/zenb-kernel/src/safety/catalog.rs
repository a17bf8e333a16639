//! Built-in safety property catalog.

use serde::{Deserialize, Serialize};

use super::formula::{Formula, Predicate};
use crate::config::SafetyConfig;
use crate::event::EventTag;
use crate::state::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyClass {
    /// Gates events; failures are shielded or rejected
    Hard,
    /// Logged as warnings, never blocks
    Liveness,
}

/// Named safety property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyProperty {
    pub name: String,
    pub description: String,
    pub class: PropertyClass,
    /// Only evaluated at steps where this holds
    pub trigger: Option<Predicate>,
    pub formula: Formula,
}

impl SafetyProperty {
    pub fn hard(name: &str, description: &str, formula: Formula) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            class: PropertyClass::Hard,
            trigger: None,
            formula,
        }
    }

    pub fn liveness(name: &str, description: &str, formula: Formula) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            class: PropertyClass::Liveness,
            trigger: None,
            formula,
        }
    }

    pub fn triggered_by(mut self, trigger: Predicate) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn is_hard(&self) -> bool {
        self.class == PropertyClass::Hard
    }
}

/// Catalog in evaluation order
pub fn standard_catalog(cfg: &SafetyConfig) -> Vec<SafetyProperty> {
    vec![
        // Property 1: Tempo bounds
        SafetyProperty::hard(
            "tempo_bounds",
            &format!(
                "Tempo must stay within [{}, {}]",
                cfg.tempo_min, cfg.tempo_max
            ),
            Formula::always(Predicate::TempoWithin {
                min: cfg.tempo_min,
                max: cfg.tempo_max,
            }),
        ),
        // Property 2: Safety lock immutable
        SafetyProperty::hard(
            "safety_lock_immutable",
            "Once in SafetyLock, cannot start new session",
            Formula::always(Predicate::ForbidDuring {
                event: EventTag::StartSession,
                status: Status::SafetyLock,
            }),
        ),
        // Property 3: Protocol lock-until
        SafetyProperty::hard(
            "protocol_lock",
            "Cannot start a session on a protocol that is still locked",
            Formula::always(Predicate::ProtocolUnlocked),
        ),
        // Property 4: Tempo rate limit
        SafetyProperty::hard(
            "tempo_rate_limit",
            &format!("Tempo cannot change faster than {}/sec", cfg.max_tempo_rate),
            Formula::always(Predicate::TempoRateLimit {
                max_rate_per_sec: cfg.max_tempo_rate,
            }),
        ),
        // Property 5: Protocol switch cooldown
        SafetyProperty::hard(
            "protocol_cooldown",
            &format!(
                "Protocol switches during a session must be {}s apart",
                cfg.protocol_cooldown_sec
            ),
            Formula::always(Predicate::Cooldown {
                event: EventTag::LoadProtocol,
                min_interval_sec: cfg.protocol_cooldown_sec,
                only_during_session: true,
            }),
        ),
        // Property 6: Panic halt
        SafetyProperty::hard(
            "panic_halt",
            "High prediction error must trigger halt",
            Formula::always(Predicate::PanicRequiresHalt {
                error_threshold: cfg.panic_error_threshold,
                min_session_sec: cfg.panic_min_session_sec,
            }),
        ),
        // Property 7: AI intervention only inside an active session
        SafetyProperty::hard(
            "intervention_scope",
            "AI intervention requires an active session until it ends",
            Formula::until(
                Predicate::SessionActive,
                Predicate::EventIs(EventTag::AiInterventionEnded),
                cfg.intervention_bound,
            ),
        )
        .triggered_by(Predicate::EventIs(EventTag::AiIntervention)),
        // Property 8: Cycle boundary resets the phase clock
        SafetyProperty::hard(
            "cycle_phase_reset",
            "Phase elapsed must be near zero right after a cycle completes",
            Formula::next(Predicate::PhaseElapsedAtMost {
                seconds: cfg.phase_reset_tolerance_sec,
            }),
        )
        .triggered_by(Predicate::EventIs(EventTag::CycleComplete)),
        // Property 9: Sustained distress must end in a halt
        SafetyProperty::liveness(
            "panic_eventually_halts",
            "Elevated prediction error must eventually lead to a halt",
            Formula::eventually(
                Predicate::StatusIn(vec![Status::Halted, Status::SafetyLock]),
                cfg.liveness_halt_bound,
            ),
        )
        .triggered_by(Predicate::PanicCondition {
            error_threshold: cfg.liveness_error_threshold,
            min_session_sec: 0.0,
        }),
    ]
}
