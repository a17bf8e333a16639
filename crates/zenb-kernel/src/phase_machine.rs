use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Inhale,
    HoldIn,
    Exhale,
    HoldOut,
}

impl Phase {
    /// Fixed cyclic order
    pub fn next(self) -> Phase {
        match self {
            Phase::Inhale => Phase::HoldIn,
            Phase::HoldIn => Phase::Exhale,
            Phase::Exhale => Phase::HoldOut,
            Phase::HoldOut => Phase::Inhale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub inhale_us: u64,
    pub hold_in_us: u64,
    pub exhale_us: u64,
    pub hold_out_us: u64,
}

impl PhaseDurations {
    pub fn total_us(&self) -> u64 {
        self.inhale_us + self.hold_in_us + self.exhale_us + self.hold_out_us
    }

    pub fn of(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Inhale => self.inhale_us,
            Phase::HoldIn => self.hold_in_us,
            Phase::Exhale => self.exhale_us,
            Phase::HoldOut => self.hold_out_us,
        }
    }
}

/// Phase entries and completed cycles produced by one `tick`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseTick {
    pub transitions: Vec<Phase>,
    pub cycles_completed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMachine {
    pub phase: Phase,
    pub elapsed_us: u64,
    pub durations: PhaseDurations,
    pub cycle_index: u64,
}

impl PhaseMachine {
    pub fn new(durations: PhaseDurations) -> Self {
        PhaseMachine {
            phase: Phase::Inhale,
            elapsed_us: 0,
            durations,
            cycle_index: 0,
        }
    }

    /// Back to the start of Inhale with a fresh cycle count
    pub fn reset(&mut self) {
        self.phase = Phase::Inhale;
        self.elapsed_us = 0;
        self.cycle_index = 0;
    }

    /// Swap durations and restart at Inhale. The cycle count is kept.
    pub fn set_durations(&mut self, durations: PhaseDurations) {
        self.durations = durations;
        self.phase = Phase::Inhale;
        self.elapsed_us = 0;
    }

    /// Swap durations mid-phase, keeping relative progress (tempo changes)
    pub fn rescale(&mut self, durations: PhaseDurations) {
        let progress = self.phase_progress() as f64;
        self.durations = durations;
        self.elapsed_us = (progress * durations.of(self.phase) as f64).round() as u64;
    }

    /// Compute remaining time in current phase
    fn remaining_us(&self) -> u64 {
        self.durations.of(self.phase).saturating_sub(self.elapsed_us)
    }

    /// Move to the next phase with a non-zero duration.
    /// Returns true when the move passed the Inhale slot (cycle completed).
    fn transition(&mut self) -> bool {
        let mut wrapped = false;
        let mut next = self.phase;
        for _ in 0..4 {
            next = next.next();
            if next == Phase::Inhale {
                wrapped = true;
            }
            if self.durations.of(next) > 0 {
                break;
            }
        }
        self.phase = next;
        self.elapsed_us = 0;
        if wrapped {
            self.cycle_index += 1;
        }
        wrapped
    }

    /// Advance by dt_us, carrying the remainder across phase boundaries
    pub fn tick(&mut self, mut dt_us: u64) -> PhaseTick {
        let mut out = PhaseTick::default();
        if self.durations.total_us() == 0 {
            return out;
        }
        loop {
            let left = self.remaining_us();
            if dt_us < left {
                self.elapsed_us = self.elapsed_us.saturating_add(dt_us);
                break;
            }
            dt_us -= left;
            if self.transition() {
                out.cycles_completed += 1;
            }
            out.transitions.push(self.phase);
        }
        out
    }

    pub fn elapsed_sec(&self) -> f32 {
        self.elapsed_us as f32 / 1_000_000.0
    }

    /// Progress through the current phase in [0, 1]
    pub fn phase_progress(&self) -> f32 {
        let dur = self.durations.of(self.phase);
        if dur == 0 {
            return 0.0;
        }
        (self.elapsed_us.min(dur) as f32) / (dur as f32)
    }
}
