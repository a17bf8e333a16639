//! Normalized sensor observation delivered once per tick.
//!
//! Acquisition pipelines (camera rPPG, wearables) live outside the kernel.
//! They must omit channels they have no confidence in instead of sending
//! zeros; `sanitized()` additionally drops anything physiologically absurd.

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

pub const HR_RANGE_BPM: (f32, f32) = (25.0, 250.0);
pub const RESP_RANGE_BPM: (f32, f32) = (1.0, 60.0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateReading {
    pub bpm: f32,
    /// Signal confidence in [0, 1]
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp_ms: i64,
    pub dt_sec: f32,
    /// Face visible to the camera
    pub visible: bool,
    pub heart_rate: Option<HeartRateReading>,
    /// Breaths per minute
    pub respiration_rate: Option<f32>,
    /// HRV-derived stress proxy (Baevsky-style, unitless)
    pub stress_index: Option<f32>,
    /// Facial affect in [-1, 1]
    pub facial_valence: Option<f32>,
}

impl Observation {
    pub fn new(timestamp_ms: i64, dt_sec: f32) -> Self {
        Self {
            timestamp_ms,
            dt_sec,
            visible: true,
            ..Default::default()
        }
    }

    pub fn with_heart_rate(mut self, bpm: f32, confidence: f32) -> Self {
        self.heart_rate = Some(HeartRateReading { bpm, confidence });
        self
    }

    pub fn with_respiration(mut self, rate: f32) -> Self {
        self.respiration_rate = Some(rate);
        self
    }

    pub fn with_stress_index(mut self, si: f32) -> Self {
        self.stress_index = Some(si);
        self
    }

    pub fn with_valence(mut self, valence: f32) -> Self {
        self.facial_valence = Some(valence);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.heart_rate.is_none()
            && self.respiration_rate.is_none()
            && self.stress_index.is_none()
            && self.facial_valence.is_none()
    }

    /// Strict check used at the ingestion boundary
    pub fn validate(&self) -> Result<(), KernelError> {
        if !self.dt_sec.is_finite() || self.dt_sec < 0.0 {
            return Err(KernelError::InvalidObservation(format!(
                "dt_sec must be finite and non-negative, got {}",
                self.dt_sec
            )));
        }
        if let Some(hr) = self.heart_rate {
            if !in_range(hr.bpm, HR_RANGE_BPM) || !in_range(hr.confidence, (0.0, 1.0)) {
                return Err(KernelError::InvalidObservation(format!(
                    "heart rate {} bpm @ {} confidence out of range",
                    hr.bpm, hr.confidence
                )));
            }
        }
        if let Some(rr) = self.respiration_rate {
            if !in_range(rr, RESP_RANGE_BPM) {
                return Err(KernelError::InvalidObservation(format!(
                    "respiration rate {} out of range",
                    rr
                )));
            }
        }
        if let Some(si) = self.stress_index {
            if !si.is_finite() || si < 0.0 {
                return Err(KernelError::InvalidObservation(format!(
                    "stress index {} must be finite and non-negative",
                    si
                )));
            }
        }
        if let Some(v) = self.facial_valence {
            if !in_range(v, (-1.0, 1.0)) {
                return Err(KernelError::InvalidObservation(format!(
                    "facial valence {} out of [-1, 1]",
                    v
                )));
            }
        }
        Ok(())
    }

    /// Copy with every malformed channel dropped
    pub fn sanitized(&self) -> Observation {
        let mut out = self.clone();
        if !out.dt_sec.is_finite() || out.dt_sec < 0.0 {
            out.dt_sec = 0.0;
        }
        out.heart_rate = self
            .heart_rate
            .filter(|hr| in_range(hr.bpm, HR_RANGE_BPM) && in_range(hr.confidence, (0.0, 1.0)));
        out.respiration_rate = self
            .respiration_rate
            .filter(|&rr| in_range(rr, RESP_RANGE_BPM));
        out.stress_index = self.stress_index.filter(|&si| si.is_finite() && si >= 0.0);
        out.facial_valence = self
            .facial_valence
            .filter(|&v| in_range(v, (-1.0, 1.0)));
        if out != *self {
            log::warn!(
                "observation @{}ms had malformed channels; dropped them",
                self.timestamp_ms
            );
        }
        out
    }
}

fn in_range(v: f32, (lo, hi): (f32, f32)) -> bool {
    v.is_finite() && v >= lo && v <= hi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_only_bad_channels() {
        let obs = Observation::new(1_000, 0.1)
            .with_heart_rate(f32::NAN, 0.9)
            .with_respiration(6.0)
            .with_valence(3.0);
        assert!(obs.validate().is_err());

        let clean = obs.sanitized();
        assert!(clean.heart_rate.is_none());
        assert_eq!(clean.respiration_rate, Some(6.0));
        assert!(clean.facial_valence.is_none());
        assert!(clean.validate().is_ok());
    }

    #[test]
    fn empty_observation_is_valid() {
        let obs = Observation::new(0, 0.1);
        assert!(obs.is_empty());
        assert!(obs.validate().is_ok());
        assert_eq!(obs.sanitized(), obs);
    }

    #[test]
    fn negative_dt_is_rejected_then_zeroed() {
        let obs = Observation::new(0, -1.0);
        assert!(matches!(
            obs.validate(),
            Err(KernelError::InvalidObservation(_))
        ));
        assert_eq!(obs.sanitized().dt_sec, 0.0);
    }
}
