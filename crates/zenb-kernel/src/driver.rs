//! Fixed-step tick driver.
//!
//! Converts variable frame times into a bounded number of fixed-size kernel
//! ticks. Time beyond the per-frame cap stays in the accumulator and is
//! folded on later frames.

use crate::config::RuntimeConfig;
use crate::kernel::RuntimeKernel;
use crate::observation::Observation;

#[derive(Debug, Clone)]
pub struct FixedStepDriver {
    step_sec: f32,
    max_ticks_per_frame: u32,
    accumulator: f32,
}

impl FixedStepDriver {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            step_sec: config.tick_dt(),
            max_ticks_per_frame: config.max_ticks_per_frame,
            accumulator: 0.0,
        }
    }

    pub fn step_sec(&self) -> f32 {
        self.step_sec
    }

    /// Time carried to the next frame
    pub fn pending_sec(&self) -> f32 {
        self.accumulator
    }

    /// Add frame time and return how many ticks to run now
    pub fn advance(&mut self, frame_sec: f32) -> u32 {
        if frame_sec.is_finite() && frame_sec > 0.0 {
            self.accumulator += frame_sec;
        }
        if self.step_sec <= 0.0 {
            return 0;
        }
        let mut ticks = 0;
        while self.accumulator >= self.step_sec && ticks < self.max_ticks_per_frame {
            self.accumulator -= self.step_sec;
            ticks += 1;
        }
        if ticks == self.max_ticks_per_frame && self.accumulator >= self.step_sec {
            log::debug!(
                "driver: tick cap reached, carrying {:.3}s",
                self.accumulator
            );
        }
        ticks
    }

    /// Advance by `frame_sec` and run the resulting ticks on `kernel`.
    /// `observe` is asked for an observation before each tick.
    pub fn drive<F>(&mut self, kernel: &mut RuntimeKernel, frame_sec: f32, mut observe: F) -> u32
    where
        F: FnMut(&RuntimeKernel) -> Option<Observation>,
    {
        let ticks = self.advance(frame_sec);
        for _ in 0..ticks {
            let obs = observe(kernel);
            kernel.tick(self.step_sec, obs);
        }
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> FixedStepDriver {
        FixedStepDriver::new(&RuntimeConfig::default())
    }

    #[test]
    fn frames_fold_into_fixed_steps() {
        let mut d = driver();
        assert_eq!(d.advance(0.05), 0);
        assert_eq!(d.advance(0.06), 1);
        assert!((d.pending_sec() - 0.01).abs() < 1e-4);
    }

    #[test]
    fn long_frame_is_capped_and_carried() {
        let mut d = driver();
        assert_eq!(d.advance(2.0), 5);
        assert!((d.pending_sec() - 1.5).abs() < 1e-4);
        assert_eq!(d.advance(0.0), 5);
        assert!((d.pending_sec() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn garbage_frame_time_is_ignored() {
        let mut d = driver();
        assert_eq!(d.advance(f32::NAN), 0);
        assert_eq!(d.advance(-1.0), 0);
        assert_eq!(d.pending_sec(), 0.0);
    }
}
