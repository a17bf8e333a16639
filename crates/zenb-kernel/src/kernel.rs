//! Runtime kernel: owns `RuntimeState`, gates events through the safety
//! monitor, folds ticks and observations, and publishes state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::estimators::{BeliefState, EstimatorDiagnostics, UkfStateEstimator};
use crate::event::{EventKind, InterdictionAction, KernelEvent};
use crate::observation::Observation;
use crate::phase_machine::{PhaseDurations, PhaseMachine};
use crate::protocol::{BreathProtocol, ProtocolTable};
use crate::safety::{EvalContext, GateOutcome, Predicate, SafetyMonitor, SafetyViolation};
use crate::state::{RuntimeState, Status};

/// Follow-up events a single dispatch may queue through middleware
const MAX_FOLLOW_UPS: usize = 64;

/// Result of `dispatch` for the caller's event
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Accepted,
    Shielded { corrected: KernelEvent },
    Rejected { property: String },
    /// Malformed or kernel-internal input, never reached the gate
    Dropped { reason: String },
}

impl DispatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Accepted | DispatchOutcome::Shielded { .. }
        )
    }
}

/// Events queued by middleware, processed before `dispatch` returns
#[derive(Debug, Default)]
pub struct FollowUps {
    events: Vec<KernelEvent>,
}

impl FollowUps {
    pub fn dispatch(&mut self, event: KernelEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Side-effect hook run after every applied event
pub trait Middleware: Send {
    fn handle(
        &mut self,
        event: &KernelEvent,
        before: &RuntimeState,
        after: &RuntimeState,
        follow_ups: &mut FollowUps,
    );
}

impl<F> Middleware for F
where
    F: FnMut(&KernelEvent, &RuntimeState, &RuntimeState, &mut FollowUps) + Send,
{
    fn handle(
        &mut self,
        event: &KernelEvent,
        before: &RuntimeState,
        after: &RuntimeState,
        follow_ups: &mut FollowUps,
    ) {
        self(event, before, after, follow_ups)
    }
}

type Callback = Box<dyn FnMut(&RuntimeState) + Send>;

struct SubscriberEntry {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct SubscriberRegistry {
    next_id: u64,
    entries: Vec<SubscriberEntry>,
    notifying: bool,
    removed_during_notify: Vec<u64>,
}

impl SubscriberRegistry {
    fn remove(&mut self, id: u64) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            self.entries.remove(pos);
            true
        } else if self.notifying {
            self.removed_during_notify.push(id);
            true
        } else {
            false
        }
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the callback registered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<SubscriberRegistry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().remove(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.entries.len())
            .finish()
    }
}

fn notify_all(registry: &Mutex<SubscriberRegistry>, state: &RuntimeState) {
    let mut entries = {
        let mut reg = registry.lock();
        reg.notifying = true;
        std::mem::take(&mut reg.entries)
    };

    for entry in entries.iter_mut() {
        let result = catch_unwind(AssertUnwindSafe(|| (entry.callback)(state)));
        if result.is_err() {
            log::error!("kernel: subscriber {} panicked, continuing", entry.id);
        }
    }

    let mut reg = registry.lock();
    reg.notifying = false;
    let removed = std::mem::take(&mut reg.removed_during_notify);
    entries.retain(|e| !removed.contains(&e.id));
    entries.append(&mut reg.entries);
    reg.entries = entries;
}

/// Running sums for the active session
#[derive(Debug, Default, Clone, Copy)]
struct SessionStats {
    started_ms: i64,
    rhythm_sum: f64,
    samples: u64,
    hr_sum: f64,
    hr_samples: u64,
}

impl SessionStats {
    fn mean_rhythm(&self) -> Option<f32> {
        (self.samples > 0).then(|| (self.rhythm_sum / self.samples as f64) as f32)
    }

    fn mean_heart_rate(&self) -> Option<f32> {
        (self.hr_samples > 0).then(|| (self.hr_sum / self.hr_samples as f64) as f32)
    }
}

/// What a finished session looked like, produced when it halts or is
/// interdicted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub protocol_id: String,
    pub started_ms: i64,
    pub ended_ms: i64,
    /// Logical running time, pauses excluded
    pub duration_sec: f32,
    pub cycles: u64,
    /// Mean of heart-rate readings confident enough for the estimator
    pub mean_heart_rate: Option<f32>,
    /// Mean rhythm alignment over running ticks
    pub mean_resonance: Option<f32>,
    pub final_belief: BeliefState,
    pub reason: String,
}

pub struct RuntimeKernel {
    config: KernelConfig,
    protocols: ProtocolTable,
    state: RuntimeState,
    phase_machine: PhaseMachine,
    base_durations: PhaseDurations,
    estimator: UkfStateEstimator,
    monitor: SafetyMonitor,
    middleware: Vec<Box<dyn Middleware>>,
    subscribers: Arc<Mutex<SubscriberRegistry>>,
    session: SessionStats,
    last_session: Option<SessionSummary>,
}

impl RuntimeKernel {
    /// Boot a kernel in Idle with the configured default protocol loaded
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        Self::with_protocols(config, ProtocolTable::builtin())
    }

    pub fn with_protocols(
        config: KernelConfig,
        protocols: ProtocolTable,
    ) -> Result<Self, KernelError> {
        config.validate()?;

        let protocol = protocols.require(&config.runtime.default_protocol)?;
        let base_durations = protocol.to_phase_durations();
        let mut estimator = UkfStateEstimator::new(Some(config.estimator.clone()));
        estimator.set_protocol(protocol);

        let state = RuntimeState::new(protocol.id.clone(), estimator.belief());
        let monitor = SafetyMonitor::new(&config.safety);

        log::info!(
            "kernel: booted with protocol {} ({} properties)",
            protocol.id,
            monitor.properties().len()
        );

        Ok(Self {
            phase_machine: PhaseMachine::new(base_durations),
            base_durations,
            protocols,
            state,
            estimator,
            monitor,
            config,
            middleware: Vec::new(),
            subscribers: Arc::new(Mutex::new(SubscriberRegistry::default())),
            session: SessionStats::default(),
            last_session: None,
        })
    }

    pub fn get_state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn protocols(&self) -> &ProtocolTable {
        &self.protocols
    }

    pub fn active_protocol(&self) -> Option<&BreathProtocol> {
        self.protocols.get(&self.state.protocol_id)
    }

    pub fn violations(&self) -> &VecDeque<SafetyViolation> {
        self.monitor.violations()
    }

    pub fn pending_obligations(&self) -> usize {
        self.monitor.pending_obligations()
    }

    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    /// Summary of the most recently ended session
    pub fn last_session(&self) -> Option<&SessionSummary> {
        self.last_session.as_ref()
    }

    pub fn estimator_diagnostics(&self) -> EstimatorDiagnostics {
        self.estimator.diagnostics()
    }

    /// Register a callback. It receives the current state immediately.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&RuntimeState) + Send + 'static,
    {
        let mut callback: Callback = Box::new(callback);
        if catch_unwind(AssertUnwindSafe(|| callback(&self.state))).is_err() {
            log::error!("kernel: subscriber panicked on initial snapshot");
        }

        let mut reg = self.subscribers.lock();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.entries.push(SubscriberEntry { id, callback });

        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Append a middleware; they run in registration order
    pub fn use_middleware<M>(&mut self, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.middleware.push(Box::new(middleware));
    }

    /// Gate, apply and publish one event plus any follow-ups it triggers
    pub fn dispatch(&mut self, event: KernelEvent) -> DispatchOutcome {
        let mut follow_ups = VecDeque::new();
        let outcome = self.dispatch_one(event, &mut follow_ups);

        let mut budget = MAX_FOLLOW_UPS;
        while let Some(next) = follow_ups.pop_front() {
            if budget == 0 {
                log::error!(
                    "kernel: follow-up limit reached, dropping {} queued events",
                    follow_ups.len() + 1
                );
                break;
            }
            budget -= 1;
            self.dispatch_one(next, &mut follow_ups);
        }
        outcome
    }

    fn dispatch_one(
        &mut self,
        event: KernelEvent,
        follow_ups: &mut VecDeque<KernelEvent>,
    ) -> DispatchOutcome {
        match &event.kind {
            EventKind::Tick { dt_sec } => {
                self.tick(*dt_sec, None);
                return DispatchOutcome::Accepted;
            }
            EventKind::CycleComplete { .. } => {
                log::warn!("kernel: CycleComplete is kernel-internal, dropped");
                return DispatchOutcome::Dropped {
                    reason: "CycleComplete is emitted by the kernel".to_string(),
                };
            }
            EventKind::LoadProtocol { protocol_id } if !self.protocols.contains(protocol_id) => {
                log::warn!("kernel: unknown protocol {}, keeping {}", protocol_id, self.state.protocol_id);
                return DispatchOutcome::Dropped {
                    reason: format!("unknown protocol: {}", protocol_id),
                };
            }
            _ => {}
        }

        let (effective, outcome) = match self.monitor.gate(&event, &self.state) {
            GateOutcome::Accepted => (event, DispatchOutcome::Accepted),
            GateOutcome::Shielded { corrected, .. } => (
                corrected.clone(),
                DispatchOutcome::Shielded { corrected },
            ),
            GateOutcome::Rejected { property } => {
                return DispatchOutcome::Rejected { property };
            }
        };

        let before = self.state.clone();
        self.apply(&effective);
        self.sync_phase_fields();

        let mut queued = FollowUps::default();
        for (i, mw) in self.middleware.iter_mut().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                mw.handle(&effective, &before, &self.state, &mut queued)
            }));
            if result.is_err() {
                log::error!("kernel: middleware {} panicked on {:?}", i, effective.tag());
            }
        }
        follow_ups.extend(queued.events);

        notify_all(&self.subscribers, &self.state);
        outcome
    }

    /// Advance logical time by `dt_sec` and fold an optional observation
    pub fn tick(&mut self, dt_sec: f32, observation: Option<Observation>) {
        let dt = if dt_sec.is_finite() && dt_sec > 0.0 {
            dt_sec
        } else {
            0.0
        };
        self.state.now_ms = self
            .state
            .now_ms
            .saturating_add((dt as f64 * 1000.0).round() as i64);

        let running = self.state.status == Status::Running;
        let mut cycles = 0;
        if running {
            let t = self.phase_machine.tick(secs_to_us(dt));
            cycles = t.cycles_completed;
            self.state.session_duration += dt;
            self.state.cycle_count += cycles;
            self.sync_phase_fields();
        }

        let observation = observation.map(|o| o.sanitized());
        let belief = match &observation {
            Some(obs) => self.estimator.update(obs, dt),
            None => self
                .estimator
                .update(&Observation::new(self.state.now_ms, dt), dt),
        };
        self.state.belief = belief;
        if observation.is_some() {
            self.state.last_observation = observation.clone();
        }
        if running {
            self.session.rhythm_sum += belief.rhythm_alignment as f64;
            self.session.samples += 1;
            let min_confidence = self.config.estimator.min_hr_confidence;
            if let Some(hr) = observation
                .as_ref()
                .and_then(|o| o.heart_rate)
                .filter(|hr| hr.confidence as f64 >= min_confidence)
            {
                self.session.hr_sum += hr.bpm as f64;
                self.session.hr_samples += 1;
            }
        }

        let now = self.state.now_ms;
        self.monitor
            .observe(&KernelEvent::new(now, EventKind::Tick { dt_sec: dt }), &self.state);
        let first_cycle = self.state.cycle_count - cycles;
        for cycle in (first_cycle + 1)..=self.state.cycle_count {
            self.monitor
                .observe(&KernelEvent::new(now, EventKind::CycleComplete { cycle }), &self.state);
        }

        notify_all(&self.subscribers, &self.state);

        if self.config.runtime.auto_interdict && self.panic_condition() {
            log::error!(
                "kernel: prediction error {:.2} past threshold, interdicting",
                self.state.belief.prediction_error
            );
            self.dispatch(KernelEvent::emergency_halt(now));
        }
    }

    fn panic_condition(&self) -> bool {
        let safety = &self.config.safety;
        Predicate::PanicCondition {
            error_threshold: safety.panic_error_threshold,
            min_session_sec: safety.panic_min_session_sec,
        }
        .eval(&EvalContext::new(&self.state, None, self.monitor.history()))
    }

    // --- EVENT SEMANTICS ---

    fn apply(&mut self, event: &KernelEvent) {
        self.state.now_ms = self.state.now_ms.max(event.ts_ms);

        match &event.kind {
            EventKind::Boot => {
                if self.state.status != Status::SafetyLock {
                    self.state.status = Status::Idle;
                }
                log::info!("kernel: boot");
            }
            EventKind::LoadProtocol { protocol_id } => self.load_protocol(protocol_id),
            EventKind::StartSession => self.start_session(),
            EventKind::Halt { reason } => self.halt(reason),
            EventKind::Pause => {
                if self.state.status == Status::Running {
                    self.state.status = Status::Paused;
                    log::info!("kernel: session paused");
                }
            }
            EventKind::Resume => {
                if self.state.status == Status::Paused {
                    self.state.status = Status::Running;
                    log::info!("kernel: session resumed");
                }
            }
            EventKind::AdjustTempo { scale, reason } => {
                self.state.tempo_scale = *scale;
                self.phase_machine
                    .rescale(scaled_durations(self.base_durations, *scale));
                log::debug!("kernel: tempo {:.3} ({})", scale, reason);
            }
            EventKind::SafetyInterdiction { action } => self.interdict(*action),
            EventKind::ResetSafetyLock => {
                if self.state.status == Status::SafetyLock {
                    self.state.status = Status::Idle;
                    self.state.lock_reason = None;
                    log::info!("kernel: safety lock reset");
                }
            }
            EventKind::LoadSafetyRegistry { profiles } => {
                self.state.safety_registry = profiles.clone();
                log::info!("kernel: loaded {} safety profiles", profiles.len());
            }
            EventKind::AiStatusChanged { status } => self.state.ai_status = *status,
            EventKind::VoiceActivity { active } => self.state.voice_active = *active,
            EventKind::AiIntervention { kind } => {
                self.state.active_intervention = Some(kind.clone());
            }
            EventKind::AiInterventionEnded => self.state.active_intervention = None,
            // Handled before gating
            EventKind::CycleComplete { .. } | EventKind::Tick { .. } => {}
        }
    }

    fn load_protocol(&mut self, protocol_id: &str) {
        let Some(protocol) = self.protocols.get(protocol_id) else {
            return;
        };
        self.base_durations = protocol.to_phase_durations();
        self.phase_machine
            .set_durations(scaled_durations(self.base_durations, self.state.tempo_scale));
        self.estimator.set_protocol(protocol);
        self.state.protocol_id = protocol.id.clone();
        log::info!("kernel: protocol {} loaded", protocol.id);
    }

    fn start_session(&mut self) {
        self.state.status = Status::Running;
        self.state.cycle_count = 0;
        self.state.session_duration = 0.0;
        self.state.lock_reason = None;
        self.phase_machine.reset();
        self.session = SessionStats {
            started_ms: self.state.now_ms,
            ..SessionStats::default()
        };
        log::info!("kernel: session started on {}", self.state.protocol_id);
    }

    fn halt(&mut self, reason: &str) {
        if self.state.is_session_active() {
            if let Some(mean) = self.session.mean_rhythm() {
                let capacity = self.config.safety.resonance_history_len;
                self.state.active_profile_mut().record_resonance(mean, capacity);
            }
            log::info!(
                "kernel: session halted after {:.1}s, {} cycles ({})",
                self.state.session_duration,
                self.state.cycle_count,
                reason
            );
            self.close_session(reason);
        }
        if self.state.status != Status::SafetyLock {
            self.state.status = Status::Halted;
        }
    }

    fn close_session(&mut self, reason: &str) {
        self.last_session = Some(SessionSummary {
            protocol_id: self.state.protocol_id.clone(),
            started_ms: self.session.started_ms,
            ended_ms: self.state.now_ms,
            duration_sec: self.state.session_duration,
            cycles: self.state.cycle_count,
            mean_heart_rate: self.session.mean_heart_rate(),
            mean_resonance: self.session.mean_rhythm(),
            final_belief: self.state.belief,
            reason: reason.to_string(),
        });
    }

    fn interdict(&mut self, action: InterdictionAction) {
        let now = self.state.now_ms;
        let safety = &self.config.safety;
        let (lock_sec, reason) = match action {
            InterdictionAction::EmergencyHalt => (safety.lockout_sec, "emergency halt"),
            InterdictionAction::Lockout { duration_sec } => (duration_sec as f32, "lockout"),
        };
        let lock_ms = (lock_sec as f64 * 1000.0).round() as i64;
        let stress = safety.incident_stress;
        if self.state.is_session_active() {
            self.close_session(reason);
        }

        self.state
            .active_profile_mut()
            .record_incident(now, stress, lock_ms);
        self.state.status = Status::SafetyLock;
        self.state.lock_reason = Some(reason.to_string());
        log::error!(
            "kernel: safety interdiction ({}) on {}, locked for {:.0}s",
            reason,
            self.state.protocol_id,
            lock_sec
        );
    }

    fn sync_phase_fields(&mut self) {
        self.state.phase = self.phase_machine.phase;
        self.state.phase_elapsed = self.phase_machine.elapsed_sec();
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut RuntimeState {
        &mut self.state
    }
}

impl std::fmt::Debug for RuntimeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeKernel")
            .field("state", &self.state)
            .field("middleware", &self.middleware.len())
            .field("subscribers", &self.subscribers)
            .finish()
    }
}

fn secs_to_us(sec: f32) -> u64 {
    (sec as f64 * 1_000_000.0).round() as u64
}

/// Stretch every phase by the tempo scale
fn scaled_durations(base: PhaseDurations, tempo: f32) -> PhaseDurations {
    let scale = |us: u64| (us as f64 * tempo as f64).round() as u64;
    PhaseDurations {
        inhale_us: scale(base.inhale_us),
        hold_in_us: scale(base.hold_in_us),
        exhale_us: scale(base.exhale_us),
        hold_out_us: scale(base.hold_out_us),
    }
}
