//! LTL Safety Monitor - runtime verification and shielding
//!
//! Every dispatched event passes through [`SafetyMonitor::gate`]:
//! 1. due Next/Until/Eventually obligations are resolved (warnings only)
//! 2. hard properties are evaluated in catalog order
//! 3. on the first failure the event is shielded if it can correct itself,
//!    otherwise rejected
//! 4. accepted events go into a bounded trace and the per-kind history, and
//!    may open new obligations
//! 5. liveness properties are evaluated for logging
//!
//! Ticks and kernel-internal events are fed through [`SafetyMonitor::observe`],
//! which runs steps 1, 4 and 5 without gating.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::catalog::{standard_catalog, PropertyClass, SafetyProperty};
use super::formula::{EvalContext, EventHistory, Formula};
use super::shield::{Correctable, ShieldContext};
use crate::config::SafetyConfig;
use crate::event::{EventKind, EventTag, KernelEvent};
use crate::state::RuntimeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    Warning,
}

/// Safety violation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub timestamp_ms: i64,
    pub property_name: String,
    pub description: String,
    pub severity: Severity,
    pub state: RuntimeState,
    pub event: Option<KernelEvent>,
}

/// Verdict for one candidate event
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Accepted,
    Shielded {
        original: KernelEvent,
        corrected: KernelEvent,
    },
    Rejected {
        property: String,
    },
}

/// Temporal check carried across steps
#[derive(Debug, Clone)]
struct Obligation {
    property: usize,
    formula: Formula,
    steps: u32,
}

enum StepResult {
    Pending,
    Discharged,
    Violated(String),
}

impl Obligation {
    fn step(&mut self, ctx: &EvalContext<'_>) -> StepResult {
        match &self.formula {
            Formula::Next(body) => {
                if body.holds_now(ctx) {
                    StepResult::Discharged
                } else {
                    StepResult::Violated("next-step condition failed".to_string())
                }
            }
            Formula::Until { hold, goal, bound } => {
                if goal.holds_now(ctx) {
                    return StepResult::Discharged;
                }
                if !hold.holds_now(ctx) {
                    return StepResult::Violated("condition released before goal".to_string());
                }
                self.steps += 1;
                if self.steps > *bound {
                    StepResult::Violated(format!("goal not reached within {} steps", bound))
                } else {
                    StepResult::Pending
                }
            }
            Formula::Eventually { body, bound } => {
                if body.holds_now(ctx) {
                    return StepResult::Discharged;
                }
                self.steps += 1;
                if self.steps > *bound {
                    StepResult::Violated(format!("not satisfied within {} steps", bound))
                } else {
                    StepResult::Pending
                }
            }
            // Immediate formulas never become obligations
            Formula::Always(_) | Formula::Atomic(_) => StepResult::Discharged,
        }
    }
}

/// Safety Monitor
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    properties: Vec<SafetyProperty>,
    tempo_min: f32,
    tempo_max: f32,
    max_tempo_rate: f32,
    trace: VecDeque<KernelEvent>,
    trace_capacity: usize,
    history: EventHistory,
    violations: VecDeque<SafetyViolation>,
    violation_capacity: usize,
    pending: Vec<Obligation>,
}

impl SafetyMonitor {
    pub fn new(cfg: &SafetyConfig) -> Self {
        Self::with_properties(cfg, standard_catalog(cfg))
    }

    pub fn with_properties(cfg: &SafetyConfig, properties: Vec<SafetyProperty>) -> Self {
        Self {
            properties,
            tempo_min: cfg.tempo_min,
            tempo_max: cfg.tempo_max,
            max_tempo_rate: cfg.max_tempo_rate,
            trace: VecDeque::with_capacity(cfg.trace_capacity),
            trace_capacity: cfg.trace_capacity,
            history: EventHistory::new(),
            violations: VecDeque::with_capacity(cfg.violation_capacity),
            violation_capacity: cfg.violation_capacity,
            pending: Vec::new(),
        }
    }

    /// Decide accept / shield / reject for `event` against `state`
    pub fn gate(&mut self, event: &KernelEvent, state: &RuntimeState) -> GateOutcome {
        self.resolve_obligations(state, event);

        if event.is_unconditional() {
            self.accept(event, state);
            return GateOutcome::Accepted;
        }

        let Some(failed) = self.first_hard_failure(state, event) else {
            self.accept(event, state);
            return GateOutcome::Accepted;
        };

        let shield_ctx = self.shield_context(state, event);
        // the property to report is whichever still blocks the correction
        let blocking = match event.correct(&shield_ctx) {
            Some(corrected) => match self.first_hard_failure(state, &corrected) {
                None => {
                    log::warn!(
                        "safety: {} violated by {:?}, shielded to {:?}",
                        self.properties[failed].name,
                        event.kind,
                        corrected.kind
                    );
                    self.record(failed, Severity::Critical, state, event, None);
                    self.accept(&corrected, state);
                    return GateOutcome::Shielded {
                        original: event.clone(),
                        corrected,
                    };
                }
                Some(idx) => idx,
            },
            None => failed,
        };

        let property = self.properties[blocking].name.clone();
        log::error!("safety: {:?} rejected by {}", event.kind, property);
        self.record(blocking, Severity::Critical, state, event, None);
        GateOutcome::Rejected { property }
    }

    /// Step obligations and liveness for an event that is not gated
    /// (ticks, kernel-internal cycle completions).
    pub fn observe(&mut self, event: &KernelEvent, state: &RuntimeState) {
        self.resolve_obligations(state, event);
        self.accept(event, state);
    }

    pub fn violations(&self) -> &VecDeque<SafetyViolation> {
        &self.violations
    }

    pub fn pending_obligations(&self) -> usize {
        self.pending.len()
    }

    /// Accepted events, oldest first
    pub fn trace(&self) -> &VecDeque<KernelEvent> {
        &self.trace
    }

    /// Last accepted timestamp per event kind, unaffected by trace eviction
    pub fn history(&self) -> &EventHistory {
        &self.history
    }

    pub fn properties(&self) -> &[SafetyProperty] {
        &self.properties
    }

    fn first_hard_failure(&self, state: &RuntimeState, event: &KernelEvent) -> Option<usize> {
        let ctx = EvalContext::new(state, Some(event), &self.history);
        self.properties.iter().position(|prop| {
            prop.class == PropertyClass::Hard
                && triggered(prop, &ctx)
                && !prop.formula.holds_now(&ctx)
        })
    }

    fn shield_context(&self, state: &RuntimeState, event: &KernelEvent) -> ShieldContext {
        let since_last_tempo_sec = self
            .history
            .last_ms(EventTag::AdjustTempo)
            .map(|last_ms| ((event.ts_ms - last_ms).max(0) as f32) / 1000.0);
        ShieldContext {
            current_tempo: state.tempo_scale,
            tempo_min: self.tempo_min,
            tempo_max: self.tempo_max,
            max_tempo_rate: self.max_tempo_rate,
            since_last_tempo_sec,
        }
    }

    fn accept(&mut self, event: &KernelEvent, state: &RuntimeState) {
        self.open_obligations(state, event, PropertyClass::Hard);

        if !matches!(event.kind, EventKind::Tick { .. }) {
            self.history.record(event);
            self.trace.push_back(event.clone());
            while self.trace.len() > self.trace_capacity {
                self.trace.pop_front();
            }
        }

        self.check_liveness(state, event);
    }

    fn check_liveness(&mut self, state: &RuntimeState, event: &KernelEvent) {
        let failing: Vec<usize> = {
            let ctx = EvalContext::new(state, Some(event), &self.history);
            self.properties
                .iter()
                .enumerate()
                .filter(|(_, p)| p.class == PropertyClass::Liveness && triggered(p, &ctx))
                .filter(|(_, p)| !p.formula.holds_now(&ctx))
                .map(|(i, _)| i)
                .collect()
        };
        for idx in failing {
            self.record(idx, Severity::Warning, state, event, None);
        }
        self.open_obligations(state, event, PropertyClass::Liveness);
    }

    /// Register temporal obligations for triggered properties of `class`
    fn open_obligations(&mut self, state: &RuntimeState, event: &KernelEvent, class: PropertyClass) {
        let ctx = EvalContext::new(state, Some(event), &self.history);
        let mut opened = Vec::new();
        for (idx, prop) in self.properties.iter().enumerate() {
            if prop.class != class || !triggered(prop, &ctx) {
                continue;
            }
            if self.pending.iter().any(|o| o.property == idx) {
                continue;
            }
            if let Some(formula) = temporal_part(&prop.formula, &ctx) {
                opened.push(Obligation {
                    property: idx,
                    formula: formula.clone(),
                    steps: 0,
                });
            }
        }
        self.pending.extend(opened);
    }

    fn resolve_obligations(&mut self, state: &RuntimeState, event: &KernelEvent) {
        if self.pending.is_empty() {
            return;
        }
        let mut violated = Vec::new();
        {
            let ctx = EvalContext::new(state, Some(event), &self.history);
            self.pending.retain_mut(|ob| match ob.step(&ctx) {
                StepResult::Pending => true,
                StepResult::Discharged => false,
                StepResult::Violated(detail) => {
                    violated.push((ob.property, detail));
                    false
                }
            });
        }
        for (idx, detail) in violated {
            log::warn!(
                "safety: obligation {} failed: {}",
                self.properties[idx].name,
                detail
            );
            self.record(idx, Severity::Warning, state, event, Some(detail));
        }
    }

    fn record(
        &mut self,
        property: usize,
        severity: Severity,
        state: &RuntimeState,
        event: &KernelEvent,
        detail: Option<String>,
    ) {
        let prop = &self.properties[property];
        let description = match detail {
            Some(d) => format!("{} ({})", prop.description, d),
            None => prop.description.clone(),
        };
        let violation = SafetyViolation {
            timestamp_ms: event.ts_ms.max(state.now_ms),
            property_name: prop.name.clone(),
            description,
            severity,
            state: state.clone(),
            event: Some(event.clone()),
        };
        self.violations.push_back(violation);
        while self.violations.len() > self.violation_capacity {
            self.violations.pop_front();
        }
    }
}

fn triggered(prop: &SafetyProperty, ctx: &EvalContext<'_>) -> bool {
    prop.trigger.as_ref().map_or(true, |t| t.eval(ctx))
}

/// The sub-formula that must be tracked past the current step, if any
fn temporal_part<'f>(formula: &'f Formula, ctx: &EvalContext<'_>) -> Option<&'f Formula> {
    match formula {
        Formula::Always(inner) => temporal_part(inner, ctx),
        Formula::Next(_) => Some(formula),
        Formula::Eventually { body, .. } => {
            if body.holds_now(ctx) {
                None
            } else {
                Some(formula)
            }
        }
        Formula::Until { goal, .. } => {
            if goal.holds_now(ctx) {
                None
            } else {
                Some(formula)
            }
        }
        Formula::Atomic(_) => None,
    }
}
