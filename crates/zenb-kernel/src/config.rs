use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::estimators::ukf::{UkfConfig, N as STATE_DIM};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub estimator: UkfConfig,
    pub safety: SafetyConfig,
    pub runtime: RuntimeConfig,
}

/// Hard limits and temporal bounds used by the safety catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Hard lower bound for tempo scale
    pub tempo_min: f32,
    /// Hard upper bound for tempo scale
    pub tempo_max: f32,
    /// Maximum tempo change per second between accepted adjustments
    pub max_tempo_rate: f32,
    /// Minimum spacing between protocol switches during a session
    pub protocol_cooldown_sec: f32,
    /// Prediction error above which a running session must be halted
    pub panic_error_threshold: f32,
    /// Session length before the panic rule arms
    pub panic_min_session_sec: f32,
    /// Prediction error that opens the advisory halt obligation
    pub liveness_error_threshold: f32,
    /// Steps allowed for the advisory halt obligation
    pub liveness_halt_bound: u32,
    /// Steps an AI intervention may stay open
    pub intervention_bound: u32,
    /// Phase elapsed allowed on the step after a cycle completes
    pub phase_reset_tolerance_sec: f32,
    /// Capacity of the violation ring
    pub violation_capacity: usize,
    /// Capacity of the accepted-event trace
    pub trace_capacity: usize,
    /// Per-protocol lockout applied by an emergency interdiction
    pub lockout_sec: f32,
    /// Stress added to a protocol's profile per emergency interdiction
    pub incident_stress: f32,
    /// Resonance samples kept per protocol profile
    pub resonance_history_len: usize,
}

/// Pacing of the cooperative tick loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick_rate_hz: f32,
    /// Ticks folded per driving frame before the remainder is carried
    pub max_ticks_per_frame: u32,
    pub default_protocol: String,
    /// Dispatch an emergency interdiction from `tick` when the panic rule fires
    pub auto_interdict: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            tempo_min: 0.8,
            tempo_max: 1.4,
            max_tempo_rate: 0.1,
            protocol_cooldown_sec: 60.0,
            panic_error_threshold: 0.95,
            panic_min_session_sec: 10.0,
            liveness_error_threshold: 0.8,
            liveness_halt_bound: 50,
            intervention_bound: 600,
            phase_reset_tolerance_sec: 0.25,
            violation_capacity: 100,
            trace_capacity: 100,
            lockout_sec: 300.0,
            incident_stress: 1.0,
            resonance_history_len: 20,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 10.0,
            max_ticks_per_frame: 5,
            default_protocol: "4-7-8".to_string(),
            auto_interdict: false,
        }
    }
}

impl RuntimeConfig {
    /// Fixed tick size in seconds
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_rate_hz
    }
}

impl KernelConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: KernelConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    /// Variables are prefixed with ZENB_, e.g. ZENB_SAFETY_TEMPO_MAX=1.3
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. User config file (if exists)
    /// 3. Default config file
    /// 4. Built-in defaults (lowest priority)
    pub fn load_layered(
        default_path: Option<&Path>,
        user_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut config = KernelConfig::default();

        if let Some(path) = default_path {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        }

        // User file replaces the default layer wholesale; missing keys fall
        // back to built-in defaults through #[serde(default)].
        if let Some(path) = user_path {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Apply overrides from the process environment
    pub(crate) fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (environment in production)
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "ZENB_ESTIMATOR_Q_SCALE", &mut self.estimator.q_scale)?;
        override_from(&lookup, "ZENB_ESTIMATOR_ALPHA", &mut self.estimator.alpha)?;
        override_from(
            &lookup,
            "ZENB_ESTIMATOR_MIN_HR_CONFIDENCE",
            &mut self.estimator.min_hr_confidence,
        )?;

        override_from(&lookup, "ZENB_SAFETY_TEMPO_MIN", &mut self.safety.tempo_min)?;
        override_from(&lookup, "ZENB_SAFETY_TEMPO_MAX", &mut self.safety.tempo_max)?;
        override_from(
            &lookup,
            "ZENB_SAFETY_MAX_TEMPO_RATE",
            &mut self.safety.max_tempo_rate,
        )?;
        override_from(
            &lookup,
            "ZENB_SAFETY_PROTOCOL_COOLDOWN_SEC",
            &mut self.safety.protocol_cooldown_sec,
        )?;
        override_from(&lookup, "ZENB_SAFETY_LOCKOUT_SEC", &mut self.safety.lockout_sec)?;

        override_from(&lookup, "ZENB_RUNTIME_TICK_RATE_HZ", &mut self.runtime.tick_rate_hz)?;
        override_from(
            &lookup,
            "ZENB_RUNTIME_MAX_TICKS_PER_FRAME",
            &mut self.runtime.max_ticks_per_frame,
        )?;
        override_from(
            &lookup,
            "ZENB_RUNTIME_DEFAULT_PROTOCOL",
            &mut self.runtime.default_protocol,
        )?;
        override_from(
            &lookup,
            "ZENB_RUNTIME_AUTO_INTERDICT",
            &mut self.runtime.auto_interdict,
        )?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let est = &self.estimator;
        if est.alpha <= 0.0 || est.alpha > 1.0 {
            return Err(ConfigError::Validation(
                "estimator.alpha must be in (0, 1]".to_string(),
            ));
        }
        // sigma-point weights divide by alpha^2 (n + kappa)
        if est.alpha.powi(2) * (STATE_DIM as f64 + est.kappa) <= 0.0 {
            return Err(ConfigError::Validation(
                "estimator.kappa must keep alpha^2 (n + kappa) positive".to_string(),
            ));
        }
        if est.q_scale <= 0.0 {
            return Err(ConfigError::Validation(
                "estimator.q_scale must be positive".to_string(),
            ));
        }
        if [est.r_hr, est.r_hrv, est.r_resp, est.r_valence]
            .iter()
            .any(|&r| r <= 0.0)
        {
            return Err(ConfigError::Validation(
                "estimator measurement variances must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&est.min_hr_confidence) {
            return Err(ConfigError::Validation(
                "estimator.min_hr_confidence must be in [0, 1]".to_string(),
            ));
        }
        if est.variance_floor <= 0.0 || est.reset_variance <= est.variance_floor {
            return Err(ConfigError::Validation(
                "estimator.reset_variance must exceed a positive variance_floor".to_string(),
            ));
        }
        if est.fallback_variance < est.reset_variance {
            return Err(ConfigError::Validation(
                "estimator.fallback_variance must be >= reset_variance".to_string(),
            ));
        }

        let s = &self.safety;
        if s.tempo_min <= 0.0 || s.tempo_min >= s.tempo_max {
            return Err(ConfigError::Validation(
                "safety.tempo_min must be in (0, tempo_max)".to_string(),
            ));
        }
        if !(s.tempo_min..=s.tempo_max).contains(&1.0) {
            return Err(ConfigError::Validation(
                "safety tempo bounds must contain the nominal tempo 1.0".to_string(),
            ));
        }
        if s.max_tempo_rate <= 0.0 {
            return Err(ConfigError::Validation(
                "safety.max_tempo_rate must be positive".to_string(),
            ));
        }
        if s.protocol_cooldown_sec < 0.0 || s.lockout_sec < 0.0 {
            return Err(ConfigError::Validation(
                "safety cooldown and lockout must be non-negative".to_string(),
            ));
        }
        if s.liveness_error_threshold > s.panic_error_threshold {
            return Err(ConfigError::Validation(
                "safety.liveness_error_threshold must be <= panic_error_threshold".to_string(),
            ));
        }
        if s.violation_capacity == 0 || s.trace_capacity == 0 {
            return Err(ConfigError::Validation(
                "safety ring capacities must be > 0".to_string(),
            ));
        }

        let r = &self.runtime;
        if r.tick_rate_hz <= 0.0 || r.tick_rate_hz > 1000.0 {
            return Err(ConfigError::Validation(
                "runtime.tick_rate_hz must be in (0, 1000]".to_string(),
            ));
        }
        if r.max_ticks_per_frame == 0 {
            return Err(ConfigError::Validation(
                "runtime.max_ticks_per_frame must be > 0".to_string(),
            ));
        }
        if r.default_protocol.is_empty() {
            return Err(ConfigError::Validation(
                "runtime.default_protocol must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Export configuration to TOML string
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self
            .to_toml_string()
            .map_err(|e| ConfigError::Validation(format!("TOML serialization error: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }
}

fn override_from<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(val) = lookup(key) {
        *slot = val
            .trim()
            .parse()
            .map_err(|_| ConfigError::Validation(format!("Invalid {}", key)))?;
    }
    Ok(())
}
