//! Temporal-logic formulas over (state, event, history).
//!
//! Atomic leaves are tagged predicates with explicit payloads. They are all
//! evaluated by [`Predicate::eval`], so a formula is plain data that can be
//! built, serialized and tested on its own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::event::{EventKind, EventTag, KernelEvent};
use crate::state::{RuntimeState, Status};

/// Float slack for rate comparisons
const RATE_EPSILON: f32 = 1e-4;

/// Timestamp of the last accepted event of each kind.
///
/// One slot per tag, kept apart from the bounded trace so rate limits and
/// cooldowns still see an adjustment after it has been evicted there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventHistory {
    last_ms: HashMap<EventTag, i64>,
}

impl EventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &KernelEvent) {
        self.last_ms.insert(event.tag(), event.ts_ms);
    }

    pub fn last_ms(&self, tag: EventTag) -> Option<i64> {
        self.last_ms.get(&tag).copied()
    }
}

/// Inputs to a predicate
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub state: &'a RuntimeState,
    pub event: Option<&'a KernelEvent>,
    pub history: &'a EventHistory,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        state: &'a RuntimeState,
        event: Option<&'a KernelEvent>,
        history: &'a EventHistory,
    ) -> Self {
        Self {
            state,
            event,
            history,
        }
    }

    /// Event time if there is one, never behind the kernel clock
    pub fn now_ms(&self) -> i64 {
        match self.event {
            Some(ev) => ev.ts_ms.max(self.state.now_ms),
            None => self.state.now_ms,
        }
    }

    fn event_tag(&self) -> Option<EventTag> {
        self.event.map(KernelEvent::tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Prospective tempo (the request, if the event is a tempo change) in range
    TempoWithin { min: f32, max: f32 },
    /// |requested - current| / seconds since the last accepted AdjustTempo
    TempoRateLimit { max_rate_per_sec: f32 },
    /// Events of `event` must be `min_interval_sec` apart
    Cooldown {
        event: EventTag,
        min_interval_sec: f32,
        only_during_session: bool,
    },
    /// `event` may not be accepted while status is `status`
    ForbidDuring { event: EventTag, status: Status },
    /// StartSession refused while the active protocol's lock-until is ahead
    ProtocolUnlocked,
    /// Running, prediction error above threshold, past the minimum session length
    PanicCondition {
        error_threshold: f32,
        min_session_sec: f32,
    },
    /// Under the panic condition only halt or interdiction is acceptable
    PanicRequiresHalt {
        error_threshold: f32,
        min_session_sec: f32,
    },
    SessionActive,
    StatusIn(Vec<Status>),
    EventIs(EventTag),
    PhaseElapsedAtMost { seconds: f32 },
}

impl Predicate {
    pub fn eval(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Predicate::TempoWithin { min, max } => {
                let tempo = match ctx.event.map(|e| &e.kind) {
                    Some(EventKind::AdjustTempo { scale, .. }) => *scale,
                    _ => ctx.state.tempo_scale,
                };
                tempo.is_finite() && tempo >= *min && tempo <= *max
            }

            Predicate::TempoRateLimit { max_rate_per_sec } => {
                let (ts, scale) = match ctx.event {
                    Some(KernelEvent {
                        ts_ms,
                        kind: EventKind::AdjustTempo { scale, .. },
                    }) => (*ts_ms, *scale),
                    _ => return true,
                };
                let Some(last_ms) = ctx.history.last_ms(EventTag::AdjustTempo) else {
                    return true;
                };
                let elapsed = ((ts - last_ms).max(0) as f32) / 1000.0;
                let delta = (scale - ctx.state.tempo_scale).abs();
                delta <= max_rate_per_sec * elapsed + RATE_EPSILON
            }

            Predicate::Cooldown {
                event,
                min_interval_sec,
                only_during_session,
            } => {
                if ctx.event_tag() != Some(*event) {
                    return true;
                }
                if *only_during_session && !ctx.state.is_session_active() {
                    return true;
                }
                match ctx.history.last_ms(*event) {
                    Some(last_ms) => {
                        let elapsed = (ctx.now_ms() - last_ms) as f32 / 1000.0;
                        elapsed >= *min_interval_sec
                    }
                    None => true,
                }
            }

            Predicate::ForbidDuring { event, status } => {
                !(ctx.event_tag() == Some(*event) && ctx.state.status == *status)
            }

            Predicate::ProtocolUnlocked => {
                if ctx.event_tag() != Some(EventTag::StartSession) {
                    return true;
                }
                !ctx
                    .state
                    .active_profile()
                    .is_some_and(|p| p.is_locked(ctx.now_ms()))
            }

            Predicate::PanicCondition {
                error_threshold,
                min_session_sec,
            } => {
                ctx.state.status == Status::Running
                    && ctx.state.belief.prediction_error > *error_threshold
                    && ctx.state.session_duration > *min_session_sec
            }

            Predicate::PanicRequiresHalt {
                error_threshold,
                min_session_sec,
            } => {
                let panic = Predicate::PanicCondition {
                    error_threshold: *error_threshold,
                    min_session_sec: *min_session_sec,
                };
                !panic.eval(ctx) || ctx.event.is_some_and(KernelEvent::is_unconditional)
            }

            Predicate::SessionActive => ctx.state.is_session_active(),

            Predicate::StatusIn(set) => set.contains(&ctx.state.status),

            Predicate::EventIs(tag) => ctx.event_tag() == Some(*tag),

            Predicate::PhaseElapsedAtMost { seconds } => ctx.state.phase_elapsed <= *seconds,
        }
    }
}

/// Recursive formula. Sub-formulas are owned by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Formula {
    Always(Box<Formula>),
    Eventually { body: Box<Formula>, bound: u32 },
    Next(Box<Formula>),
    Until {
        hold: Box<Formula>,
        goal: Box<Formula>,
        bound: u32,
    },
    Atomic(Predicate),
}

impl Formula {
    pub fn atomic(p: Predicate) -> Self {
        Formula::Atomic(p)
    }

    pub fn always(p: Predicate) -> Self {
        Formula::Always(Box::new(Formula::Atomic(p)))
    }

    pub fn next(p: Predicate) -> Self {
        Formula::Next(Box::new(Formula::Atomic(p)))
    }

    pub fn eventually(p: Predicate, bound: u32) -> Self {
        Formula::Eventually {
            body: Box::new(Formula::Atomic(p)),
            bound,
        }
    }

    pub fn until(hold: Predicate, goal: Predicate, bound: u32) -> Self {
        Formula::Until {
            hold: Box::new(Formula::Atomic(hold)),
            goal: Box::new(Formula::Atomic(goal)),
            bound,
        }
    }

    /// Verdict at the current step.
    ///
    /// Next and Eventually are optimistic here; their checks happen later
    /// through the obligation queue. Until holds now if the goal holds, or
    /// if the hold condition still does.
    pub fn holds_now(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Formula::Atomic(p) => p.eval(ctx),
            Formula::Always(inner) => inner.holds_now(ctx),
            Formula::Next(_) => true,
            Formula::Eventually { .. } => true,
            Formula::Until { hold, goal, .. } => goal.holds_now(ctx) || hold.holds_now(ctx),
        }
    }
}
