//! Feedback control and protocol suggestions.
//!
//! [`TempoController`] turns rhythm alignment into tempo requests. It never
//! touches the kernel itself: every request is an ordinary `AdjustTempo`
//! event that the caller dispatches, so bounds and rate limits still apply.
//! [`PatternRecommender`] ranks the protocol table for a time of day.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::event::KernelEvent;
use crate::protocol::{BreathProtocol, ProtocolTable};
use crate::state::{RuntimeState, Status};

/// Tempo the controller output is added to
const NOMINAL_TEMPO: f32 = 1.0;
/// Alignment error is fed to the PID in percentage points
const ALIGNMENT_ERROR_SCALE: f32 = 100.0;
/// Recently used protocols remembered for the variety bonus
const RECENT_CAPACITY: usize = 5;

// ============================================================================
// PID
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Anti-windup bound on the accumulated integral
    pub integral_max: f32,
    pub output_min: f32,
    pub output_max: f32,
    /// Low-pass weight of the newest derivative sample, in (0, 1]
    pub derivative_alpha: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.003,
            ki: 0.0002,
            kd: 0.008,
            integral_max: 5.0,
            output_min: -0.6,
            output_max: 0.4,
            derivative_alpha: 0.15,
        }
    }
}

/// Terms of the last `compute` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidDiagnostics {
    pub p_term: f32,
    pub i_term: f32,
    pub d_term: f32,
    pub integral: f32,
    /// Unclamped sum of the three terms
    pub total: f32,
}

/// PID controller with a clamped integral and a low-pass filtered derivative
#[derive(Debug, Clone)]
pub struct PidController {
    cfg: PidConfig,
    integral: f32,
    last_error: Option<f32>,
    derivative: f32,
    last: PidDiagnostics,
}

impl PidController {
    pub fn new(cfg: PidConfig) -> Self {
        Self {
            cfg,
            integral: 0.0,
            last_error: None,
            derivative: 0.0,
            last: PidDiagnostics::default(),
        }
    }

    pub fn config(&self) -> &PidConfig {
        &self.cfg
    }

    /// Control output for `error` (setpoint - measurement) after `dt` seconds.
    ///
    /// Returns 0 and leaves the state alone for a non-positive or non-finite
    /// `dt`, or a non-finite error. The first sample contributes no
    /// derivative.
    pub fn compute(&mut self, error: f32, dt: f32) -> f32 {
        if !(dt.is_finite() && dt > 0.0) || !error.is_finite() {
            return 0.0;
        }
        let cfg = self.cfg;

        let p = cfg.kp * error;

        self.integral = (self.integral + error * dt).clamp(-cfg.integral_max, cfg.integral_max);
        let i = cfg.ki * self.integral;

        let raw = self.last_error.map_or(0.0, |prev| (error - prev) / dt);
        self.derivative =
            cfg.derivative_alpha * raw + (1.0 - cfg.derivative_alpha) * self.derivative;
        let d = cfg.kd * self.derivative;

        self.last_error = Some(error);
        let total = p + i + d;
        self.last = PidDiagnostics {
            p_term: p,
            i_term: i,
            d_term: d,
            integral: self.integral,
            total,
        };
        total.clamp(cfg.output_min, cfg.output_max)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.derivative = 0.0;
        self.last = PidDiagnostics::default();
    }

    pub fn diagnostics(&self) -> PidDiagnostics {
        self.last
    }

    /// Retune without resetting accumulated state
    pub fn set_gains(&mut self, kp: Option<f32>, ki: Option<f32>, kd: Option<f32>) {
        if let Some(kp) = kp {
            self.cfg.kp = kp;
        }
        if let Some(ki) = ki {
            self.cfg.ki = ki;
        }
        if let Some(kd) = kd {
            self.cfg.kd = kd;
        }
    }
}

/// PID tuned for tempo: output spans tempo 0.4 to 1.4 around nominal
pub fn create_tempo_controller() -> PidController {
    PidController::new(PidConfig::default())
}

// ============================================================================
// TEMPO CONTROL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoControllerConfig {
    /// Rhythm alignment the loop steers toward, in [0, 1]
    pub target_alignment: f32,
    pub min_decision_interval_ms: i64,
    /// Requests closer than this to the current tempo are not emitted
    pub decision_epsilon: f32,
}

impl Default for TempoControllerConfig {
    fn default() -> Self {
        Self {
            target_alignment: 0.8,
            min_decision_interval_ms: 1_000,
            decision_epsilon: 0.005,
        }
    }
}

/// Closes the loop from rhythm alignment to `AdjustTempo` requests.
///
/// Poor alignment gives a positive error and a slower (larger) tempo scale.
#[derive(Debug, Clone)]
pub struct TempoController {
    pub cfg: TempoControllerConfig,
    pid: PidController,
    last_sample_ms: Option<i64>,
    last_decision_ms: Option<i64>,
}

impl TempoController {
    pub fn new(cfg: TempoControllerConfig) -> Self {
        Self::with_pid(cfg, create_tempo_controller())
    }

    pub fn with_pid(cfg: TempoControllerConfig, pid: PidController) -> Self {
        Self {
            cfg,
            pid,
            last_sample_ms: None,
            last_decision_ms: None,
        }
    }

    pub fn pid(&self) -> &PidController {
        &self.pid
    }

    /// Feed the latest kernel state. Returns a tempo request when one is due;
    /// the caller dispatches it so the safety gate decides what is applied.
    pub fn update(&mut self, state: &RuntimeState) -> Option<KernelEvent> {
        if state.status != Status::Running {
            if self.last_sample_ms.is_some() {
                self.reset();
            }
            return None;
        }

        let now = state.now_ms;
        let prev = self.last_sample_ms.replace(now)?;
        let dt = (now - prev) as f32 / 1000.0;
        let error =
            (self.cfg.target_alignment - state.belief.rhythm_alignment) * ALIGNMENT_ERROR_SCALE;
        let output = self.pid.compute(error, dt);

        let due = self
            .last_decision_ms
            .map_or(true, |last| now - last >= self.cfg.min_decision_interval_ms);
        let request = NOMINAL_TEMPO + output;
        if !due || (request - state.tempo_scale).abs() < self.cfg.decision_epsilon {
            return None;
        }

        self.last_decision_ms = Some(now);
        log::debug!(
            "controller: alignment {:.2}, requesting tempo {:.3}",
            state.belief.rhythm_alignment,
            request
        );
        Some(KernelEvent::adjust_tempo(now, request, "pid"))
    }

    pub fn reset(&mut self) {
        self.pid.reset();
        self.last_sample_ms = None;
        self.last_decision_ms = None;
    }
}

impl Default for TempoController {
    fn default() -> Self {
        Self::new(TempoControllerConfig::default())
    }
}

// ============================================================================
// RECOMMENDATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    /// Local hour 0-23; anything else counts as night
    pub fn from_hour(hour: u8) -> Self {
        match hour {
            6..=11 => TimeOfDay::Morning,
            12..=17 => TimeOfDay::Afternoon,
            18..=21 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }

    pub fn desired_arousal(self) -> f32 {
        match self {
            TimeOfDay::Morning => 0.3,
            TimeOfDay::Afternoon => 0.0,
            TimeOfDay::Evening => -0.5,
            TimeOfDay::Night => -0.8,
        }
    }

    pub fn goal(self) -> Goal {
        match self {
            TimeOfDay::Morning => Goal::Energy,
            TimeOfDay::Afternoon => Goal::Focus,
            TimeOfDay::Evening => Goal::Stress,
            TimeOfDay::Night => Goal::Sleep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Goal {
    Sleep,
    Stress,
    Focus,
    Energy,
    General,
}

impl Goal {
    fn reason(self) -> &'static str {
        match self {
            Goal::Sleep => "Great for sleep",
            Goal::Stress => "Great for stress relief",
            Goal::Focus => "Great for focus",
            Goal::Energy => "Great for energy",
            Goal::General => "Recommended for you",
        }
    }
}

const NO_GOALS: &[Goal] = &[];

/// Difficulty (1 easy .. 3 advanced) and goals per built-in protocol.
/// Protocols missing here score as medium difficulty with no goal.
const PROTOCOL_TRAITS: &[(&str, u8, &[Goal])] = &[
    ("4-7-8", 1, &[Goal::Sleep, Goal::Stress]),
    ("box", 1, &[Goal::Focus, Goal::General]),
    ("calm", 1, &[Goal::General, Goal::Stress]),
    ("coherence", 2, &[Goal::Focus, Goal::General]),
    ("deep-relax", 1, &[Goal::Stress, Goal::Sleep]),
    ("7-11", 2, &[Goal::Stress, Goal::Sleep]),
    ("awake", 2, &[Goal::Energy]),
    ("triangle", 1, &[Goal::General, Goal::Focus]),
    ("tactical", 2, &[Goal::Focus]),
    ("buteyko", 3, &[Goal::General]),
    ("wim-hof", 3, &[Goal::Energy]),
];

fn traits_of(id: &str) -> (u8, &'static [Goal]) {
    PROTOCOL_TRAITS
        .iter()
        .find(|(pid, _, _)| *pid == id)
        .map_or((2, NO_GOALS), |(_, complexity, goals)| (*complexity, *goals))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub protocol_id: String,
    pub score: f32,
    pub reason: String,
}

/// Ranks protocols by arousal fit, goal, variety and difficulty
#[derive(Debug, Clone, Default)]
pub struct PatternRecommender {
    recent: VecDeque<String>,
}

impl PatternRecommender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a protocol the user just ran; newest first
    pub fn record(&mut self, protocol_id: impl Into<String>) {
        self.recent.push_front(protocol_id.into());
        self.recent.truncate(RECENT_CAPACITY);
    }

    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    pub fn clear_history(&mut self) {
        self.recent.clear();
    }

    /// Best `limit` protocols of `table` for `local_hour`, highest score first
    pub fn recommend(
        &self,
        table: &ProtocolTable,
        local_hour: u8,
        limit: usize,
    ) -> Vec<Recommendation> {
        let time = TimeOfDay::from_hour(local_hour);
        let mut scored: Vec<Recommendation> = table.iter().map(|p| self.score(p, time)).collect();
        // stable: ties keep the table's id order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }

    pub fn top_recommendation(
        &self,
        table: &ProtocolTable,
        local_hour: u8,
    ) -> Option<Recommendation> {
        self.recommend(table, local_hour, 1).into_iter().next()
    }

    fn score(&self, protocol: &BreathProtocol, time: TimeOfDay) -> Recommendation {
        let (complexity, goals) = traits_of(&protocol.id);
        let goal = time.goal();
        let mut reasons: Vec<&str> = Vec::new();

        // arousal fit, up to 40
        let arousal_diff = (protocol.arousal_impact - time.desired_arousal()).abs();
        let mut score = (40.0 - arousal_diff * 30.0).max(0.0);

        if goals.contains(&goal) {
            score += 30.0;
            reasons.push(goal.reason());
        }

        // variety, up to 20
        let times_recent = self.recent.iter().filter(|id| **id == protocol.id).count();
        score += (20.0 - times_recent as f32 * 10.0).max(0.0);
        if times_recent == 0 {
            reasons.push("Try something new");
        }

        score += f32::from(4u8.saturating_sub(complexity)) * 3.0;

        let bonus = match (time, protocol.id.as_str()) {
            (TimeOfDay::Morning, "awake") => Some((15.0, "Perfect for morning energy")),
            (TimeOfDay::Night, "4-7-8") => Some((15.0, "Ideal for sleep")),
            (TimeOfDay::Afternoon, "box") => Some((10.0, "Great for afternoon focus")),
            _ => None,
        };
        if let Some((points, reason)) = bonus {
            score += points;
            reasons.insert(0, reason);
        }

        Recommendation {
            protocol_id: protocol.id.clone(),
            score,
            reason: reasons
                .first()
                .copied()
                .unwrap_or(Goal::General.reason())
                .to_string(),
        }
    }
}
