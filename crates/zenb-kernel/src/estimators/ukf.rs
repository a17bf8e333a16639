//! Unscented Kalman Filter (UKF) for non-linear state estimation
//!
//! Implements a 5-dimensional state estimator for physiological signals:
//! - Arousal
//! - dArousal/dt (momentum)
//! - Valence
//! - Attention
//! - Rhythm alignment
//!
//! All 5x5 math runs on stack-allocated `nalgebra` fixed-size types in f64.
//! Observation channels are fused sequentially, one scalar correction per
//! present channel, with Mahalanobis outlier gating and a Joseph-form
//! covariance update.

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

use crate::observation::Observation;
use crate::protocol::{ArousalCategory, BreathProtocol};

// State dimension
/// State dimension
pub(crate) const N: usize = 5;
const SIGMA_COUNT: usize = 2 * N + 1;

const AROUSAL: usize = 0;
const AROUSAL_VEL: usize = 1;
const VALENCE: usize = 2;
const ATTENTION: usize = 3;
const RHYTHM: usize = 4;

type StateVector = SVector<f64, N>;
type CovarianceMatrix = SMatrix<f64, N, N>;
type SigmaPoints = [StateVector; SIGMA_COUNT];

/// UKF Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UkfConfig {
    /// Process noise scale (per second)
    pub q_scale: f64,

    /// Measurement noise variances
    pub r_hr: f64,
    pub r_hrv: f64,
    pub r_resp: f64,
    pub r_valence: f64,

    /// Spread of sigma points
    pub alpha: f64,
    /// Distribution shape (2.0 is optimal for Gaussian priors)
    pub beta: f64,
    /// Secondary scaling
    pub kappa: f64,

    /// Heart-rate readings below this confidence are ignored
    pub min_hr_confidence: f64,
    /// Normalized innovation above which a channel is discarded
    pub outlier_threshold: f64,
    /// Lower bound for every diagonal covariance entry
    pub variance_floor: f64,
    /// Diagonal used when the covariance loses positive-definiteness
    pub reset_variance: f64,
    /// Diagonal used once resets are exhausted
    pub fallback_variance: f64,
    /// Consecutive resets allowed before the permanent fallback
    pub max_covariance_resets: u32,
}

impl Default for UkfConfig {
    fn default() -> Self {
        Self {
            q_scale: 0.01,
            r_hr: 0.15,
            r_hrv: 0.25,
            r_resp: 0.20,
            r_valence: 0.30,
            alpha: 1.0,
            beta: 2.0,
            kappa: 0.0,
            min_hr_confidence: 0.3,
            outlier_threshold: 3.0,
            variance_floor: 1e-6,
            reset_variance: 0.2,
            fallback_variance: 0.5,
            max_covariance_resets: 3,
        }
    }
}

/// Target state the dynamics relax toward
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub arousal: f64,
    pub attention: f64,
    pub rhythm: f64,
    pub valence: f64,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            arousal: 0.5,
            attention: 0.6,
            rhythm: 0.7,
            valence: 0.5,
        }
    }
}

impl TargetState {
    pub fn for_category(category: ArousalCategory) -> Self {
        match category {
            ArousalCategory::Parasympathetic => TargetState {
                arousal: 0.2,
                attention: 0.5,
                rhythm: 0.8,
                valence: 0.6,
            },
            ArousalCategory::Sympathetic => TargetState {
                arousal: 0.7,
                attention: 0.8,
                rhythm: 0.6,
                valence: 0.7,
            },
            ArousalCategory::Balanced => TargetState {
                arousal: 0.4,
                attention: 0.7,
                rhythm: 0.9,
                valence: 0.5,
            },
        }
    }
}

/// Belief state published to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BeliefState {
    pub arousal: f32,
    pub attention: f32,
    pub rhythm_alignment: f32,
    pub valence: f32,

    pub arousal_variance: f32,
    pub attention_variance: f32,
    pub rhythm_variance: f32,
    pub valence_variance: f32,

    pub prediction_error: f32,
    pub innovation: f32,
    pub confidence: f32,
}

/// Outcome of one scalar correction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelOutcome {
    Applied { innovation: f64 },
    Outlier { distance: f64 },
    Degenerate,
}

/// Counters for inspection and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatorDiagnostics {
    pub accepted_channels: u64,
    pub rejected_channels: u64,
    pub covariance_resets: u64,
    pub fallback_engaged: bool,
}

/// Unscented Kalman Filter State Estimator
#[derive(Debug, Clone)]
pub struct UkfStateEstimator {
    x: StateVector,      // State [arousal, dA/dt, valence, attention, rhythm]
    p: CovarianceMatrix, // Covariance
    config: UkfConfig,
    target: TargetState,

    // UKF weights (precomputed)
    weights_m: [f64; SIGMA_COUNT],
    weights_c: [f64; SIGMA_COUNT],
    lambda: f64,

    // Time constants (physiological dynamics)
    tau_arousal: f64,
    tau_arousal_vel: f64,
    tau_attention: f64,
    tau_rhythm: f64,
    tau_valence: f64,

    consecutive_resets: u32,
    last_innovation: f64,
    diagnostics: EstimatorDiagnostics,
}

impl UkfStateEstimator {
    /// Create new UKF estimator
    pub fn new(config: Option<UkfConfig>) -> Self {
        let cfg = config.unwrap_or_default();
        let n = N as f64;
        let lambda = cfg.alpha.powi(2) * (n + cfg.kappa) - n;

        // Precompute weights
        let w0_m = lambda / (n + lambda);
        let w0_c = w0_m + (1.0 - cfg.alpha.powi(2) + cfg.beta);
        let wi = 1.0 / (2.0 * (n + lambda));

        let mut weights_m = [wi; SIGMA_COUNT];
        let mut weights_c = [wi; SIGMA_COUNT];
        weights_m[0] = w0_m;
        weights_c[0] = w0_c;

        Self {
            x: Self::initial_state(),
            p: CovarianceMatrix::identity() * cfg.reset_variance,
            config: cfg,
            target: TargetState::default(),
            weights_m,
            weights_c,
            lambda,
            tau_arousal: 15.0,
            tau_arousal_vel: 5.0,
            tau_attention: 5.0,
            tau_rhythm: 10.0,
            tau_valence: 8.0,
            consecutive_resets: 0,
            last_innovation: 0.0,
            diagnostics: EstimatorDiagnostics::default(),
        }
    }

    fn initial_state() -> StateVector {
        StateVector::from([0.5, 0.0, 0.0, 0.5, 0.0])
    }

    /// Re-derive the target from the protocol's arousal impact.
    /// Mean and covariance are left untouched.
    pub fn set_protocol(&mut self, protocol: &BreathProtocol) {
        self.set_target_category(protocol.category());
    }

    pub fn set_target_category(&mut self, category: ArousalCategory) {
        self.target = TargetState::for_category(category);
    }

    pub fn target(&self) -> TargetState {
        self.target
    }

    pub fn diagnostics(&self) -> EstimatorDiagnostics {
        self.diagnostics
    }

    pub fn config(&self) -> &UkfConfig {
        &self.config
    }

    /// Current mean [arousal, dA/dt, valence, attention, rhythm]
    pub fn mean(&self) -> [f64; N] {
        let mut out = [0.0; N];
        out.copy_from_slice(self.x.as_slice());
        out
    }

    /// Current covariance, row-major
    pub fn covariance(&self) -> [[f64; N]; N] {
        let mut out = [[0.0; N]; N];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = self.p[(i, j)];
            }
        }
        out
    }

    /// Main update step
    pub fn update(&mut self, obs: &Observation, dt: f32) -> BeliefState {
        let dt = if dt.is_finite() && dt > 0.0 {
            dt as f64
        } else {
            0.0
        };
        self.last_innovation = 0.0;

        // 1. Prediction (a zero-length step is the identity)
        if dt > 0.0 {
            self.predict(dt);
        }

        // 2. Correction
        self.correct(obs);

        self.guard_finite();

        // 3. Convert to BeliefState
        self.belief()
    }

    // --- PREDICTION ---

    fn predict(&mut self, dt: f64) {
        let sigmas = self.generate_sigma_points();

        let sigmas_pred = sigmas.map(|s| self.state_dynamics(&s, dt));

        // Predicted mean, kept inside the physiological domain
        self.x = clamp_to_domain(self.weighted_mean(&sigmas_pred));

        // Predicted covariance + process noise
        let mut p = self.weighted_covariance(&sigmas_pred, &self.x);
        p += CovarianceMatrix::identity() * (self.config.q_scale * dt);
        self.p = self.stabilize(p);
    }

    fn state_dynamics(&self, x: &StateVector, dt: f64) -> StateVector {
        let a = x[AROUSAL];
        let da = x[AROUSAL_VEL];
        let v = x[VALENCE];
        let att = x[ATTENTION];
        let r = x[RHYTHM];

        // 1. Arousal (damped logistic relaxation with momentum)
        let k = 0.1;
        let dda = -k * a * (1.0 - a) - da / self.tau_arousal_vel
            + (self.target.arousal - a) / self.tau_arousal;
        let a_new = a + da * dt;
        let da_new = da + dda * dt;

        // 2. Valence (inverted-U / Yerkes-Dodson)
        let v_optimal = 0.4;
        let v_target = self.target.valence - (a - v_optimal).abs() * 0.5;
        let v_new = v + (v_target - v) / self.tau_valence * dt;

        // 3. Attention (decay + rhythm boost)
        let att_decay = (-dt / self.tau_attention).exp();
        let att_boost = r * 0.1 * dt;
        let att_new = att * att_decay + att_boost;

        // 4. Rhythm (linear relaxation toward protocol target)
        let r_new = r + (self.target.rhythm - r) / self.tau_rhythm * dt;

        clamp_to_domain(StateVector::from([a_new, da_new, v_new, att_new, r_new]))
    }

    // --- CORRECTION ---

    fn correct(&mut self, obs: &Observation) {
        // Heart Rate
        if let Some(hr) = obs.heart_rate {
            let conf = hr.confidence as f64;
            if conf >= self.config.min_hr_confidence {
                let z = (hr.bpm as f64 - 50.0) / 70.0;
                let r = self.config.r_hr * (1.0 + (1.0 - conf));
                self.fuse("heart_rate", z, r, |x| x[AROUSAL]);
            } else {
                log::debug!("ukf: heart rate confidence {:.2} below gate", conf);
            }
        }

        // Stress Index (HRV), attenuated by rhythm alignment
        if let Some(si) = obs.stress_index {
            let z = (si as f64 / 300.0).min(1.0);
            let r = self.config.r_hrv;
            self.fuse("stress_index", z, r, |x| x[AROUSAL] * (1.0 - x[RHYTHM]));
        }

        // Respiration rate, 4..20 breaths/min spans the arousal range
        if let Some(rr) = obs.respiration_rate {
            let z = (rr as f64 - 4.0) / 16.0;
            let r = self.config.r_resp;
            self.fuse("respiration", z, r, |x| x[AROUSAL]);
        }

        // Facial Valence (camera channel, needs a visible face)
        if let Some(val) = obs.facial_valence {
            if obs.visible {
                let r = self.config.r_valence;
                self.fuse("facial_valence", val as f64, r, |x| x[VALENCE]);
            }
        }
    }

    fn fuse(&mut self, channel: &str, z: f64, r: f64, h: fn(&StateVector) -> f64) {
        if !z.is_finite() {
            return;
        }
        match self.correct_single(z, r, h) {
            ChannelOutcome::Applied { innovation } => {
                self.diagnostics.accepted_channels += 1;
                self.last_innovation = self.last_innovation.max(innovation.abs());
            }
            ChannelOutcome::Outlier { distance } => {
                self.diagnostics.rejected_channels += 1;
                log::debug!("ukf: {} rejected as outlier (d={:.2})", channel, distance);
            }
            ChannelOutcome::Degenerate => {
                self.diagnostics.rejected_channels += 1;
                log::warn!("ukf: {} innovation covariance degenerate", channel);
            }
        }
    }

    fn correct_single(&mut self, z: f64, r: f64, h: fn(&StateVector) -> f64) -> ChannelOutcome {
        let sigmas = self.generate_sigma_points();
        let z_sigmas = sigmas.map(|s| h(&s));
        let z_pred = self.weighted_mean_1d(&z_sigmas);

        // Innovation covariance S
        let mut s = r;
        for (zs, w) in z_sigmas.iter().zip(self.weights_c.iter()) {
            let diff = zs - z_pred;
            s += w * diff * diff;
        }
        if !s.is_finite() || s <= 0.0 {
            return ChannelOutcome::Degenerate;
        }

        // Cross-covariance Pxz
        let mut pxz = StateVector::zeros();
        for i in 0..SIGMA_COUNT {
            let x_diff = sigmas[i] - self.x;
            let z_diff = z_sigmas[i] - z_pred;
            pxz += x_diff * (self.weights_c[i] * z_diff);
        }

        // Innovation
        let innovation = z - z_pred;

        // Outlier rejection (Mahalanobis)
        let distance = innovation.abs() / s.sqrt();
        if distance > self.config.outlier_threshold {
            return ChannelOutcome::Outlier { distance };
        }

        // Kalman gain
        let k = pxz / s;

        // Update state
        self.x = clamp_to_domain(self.x + k * innovation);

        // Joseph form with H approximated from Pxz and the prior variances
        let floor = self.config.variance_floor;
        let h_row = StateVector::from_fn(|i, _| pxz[i] / self.p[(i, i)].max(floor));
        let i_kh = CovarianceMatrix::identity() - k * h_row.transpose();
        let p = i_kh * self.p * i_kh.transpose() + k * r * k.transpose();
        self.p = self.stabilize(p);

        ChannelOutcome::Applied { innovation }
    }

    // --- SIGMA POINTS ---

    fn generate_sigma_points(&mut self) -> SigmaPoints {
        let n = N as f64;
        let scale = (n + self.lambda).sqrt();
        let l = self.covariance_sqrt();

        let mut sigmas = [self.x; SIGMA_COUNT];
        for i in 0..N {
            let col = l.column(i) * scale;
            sigmas[2 * i + 1] = self.x + col;
            sigmas[2 * i + 2] = self.x - col;
        }
        sigmas
    }

    /// Lower Cholesky factor of P with bounded recovery.
    ///
    /// A failed factorization resets P to `reset_variance * I`. After
    /// `max_covariance_resets` consecutive resets the estimator switches to
    /// `fallback_variance * I` for good and stops retrying.
    fn covariance_sqrt(&mut self) -> CovarianceMatrix {
        if let Some(l) = try_cholesky(&self.p) {
            if !self.diagnostics.fallback_engaged {
                self.consecutive_resets = 0;
            }
            return l;
        }

        if !self.diagnostics.fallback_engaged {
            while self.consecutive_resets < self.config.max_covariance_resets {
                self.consecutive_resets += 1;
                self.diagnostics.covariance_resets += 1;
                log::warn!(
                    "ukf: covariance not positive definite, reset {}/{}",
                    self.consecutive_resets,
                    self.config.max_covariance_resets
                );
                self.p = CovarianceMatrix::identity() * self.config.reset_variance;
                if let Some(l) = try_cholesky(&self.p) {
                    return l;
                }
            }
            log::error!("ukf: covariance resets exhausted, engaging diagonal fallback");
            self.diagnostics.fallback_engaged = true;
        }

        self.p = CovarianceMatrix::identity() * self.config.fallback_variance;
        CovarianceMatrix::identity() * self.config.fallback_variance.sqrt()
    }

    // --- HELPERS ---

    fn weighted_mean(&self, vectors: &SigmaPoints) -> StateVector {
        let mut mean = StateVector::zeros();
        for (v, w) in vectors.iter().zip(self.weights_m.iter()) {
            mean += v * *w;
        }
        mean
    }

    fn weighted_mean_1d(&self, values: &[f64; SIGMA_COUNT]) -> f64 {
        values
            .iter()
            .zip(self.weights_m.iter())
            .map(|(v, w)| v * w)
            .sum()
    }

    fn weighted_covariance(&self, vectors: &SigmaPoints, mean: &StateVector) -> CovarianceMatrix {
        let mut cov = CovarianceMatrix::zeros();
        for (v, w) in vectors.iter().zip(self.weights_c.iter()) {
            let diff = v - mean;
            cov += diff * diff.transpose() * *w;
        }
        cov
    }

    /// Symmetrize and floor the diagonal
    fn stabilize(&self, p: CovarianceMatrix) -> CovarianceMatrix {
        if p.iter().any(|v| !v.is_finite()) {
            log::warn!("ukf: non-finite covariance, resetting diagonal");
            return CovarianceMatrix::identity() * self.config.reset_variance;
        }
        let mut sym = (p + p.transpose()) * 0.5;
        let floor = self.config.variance_floor;
        for i in 0..N {
            if sym[(i, i)] < floor {
                sym[(i, i)] = floor;
            }
        }
        sym
    }

    fn guard_finite(&mut self) {
        if self.x.iter().any(|v| !v.is_finite()) {
            log::error!("ukf: non-finite state, restoring initial mean");
            self.x = Self::initial_state();
            self.p = CovarianceMatrix::identity() * self.config.reset_variance;
        }
    }

    /// Belief read off the current mean and covariance
    pub fn belief(&self) -> BeliefState {
        let prediction_error = (((self.x[AROUSAL] - self.target.arousal).powi(2)
            + (self.x[RHYTHM] - self.target.rhythm).powi(2))
            / 2.0)
            .sqrt();

        let mean_variance = self.p.trace() / N as f64;
        let confidence = (1.0 - mean_variance).clamp(0.0, 1.0);

        BeliefState {
            arousal: self.x[AROUSAL] as f32,
            attention: self.x[ATTENTION] as f32,
            rhythm_alignment: self.x[RHYTHM] as f32,
            valence: self.x[VALENCE] as f32,
            arousal_variance: self.p[(AROUSAL, AROUSAL)] as f32,
            attention_variance: self.p[(ATTENTION, ATTENTION)] as f32,
            rhythm_variance: self.p[(RHYTHM, RHYTHM)] as f32,
            valence_variance: self.p[(VALENCE, VALENCE)] as f32,
            prediction_error: prediction_error as f32,
            innovation: self.last_innovation as f32,
            confidence: confidence as f32,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_covariance(&mut self, p: [[f64; N]; N]) {
        self.p = CovarianceMatrix::from_fn(|i, j| p[i][j]);
    }
}

impl Default for UkfStateEstimator {
    fn default() -> Self {
        Self::new(None)
    }
}

fn try_cholesky(p: &CovarianceMatrix) -> Option<CovarianceMatrix> {
    if p.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let l = p.cholesky()?.l();
    if l.iter().all(|v| v.is_finite()) {
        Some(l)
    } else {
        None
    }
}

fn clamp_to_domain(x: StateVector) -> StateVector {
    StateVector::from([
        x[AROUSAL].clamp(0.0, 1.0),
        x[AROUSAL_VEL].clamp(-0.5, 0.5),
        x[VALENCE].clamp(-1.0, 1.0),
        x[ATTENTION].clamp(0.0, 1.0),
        x[RHYTHM].clamp(0.0, 1.0),
    ])
}
