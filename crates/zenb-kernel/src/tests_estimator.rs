//! Estimator behavior over realistic observation streams

use crate::estimators::{UkfConfig, UkfStateEstimator};
use crate::observation::Observation;
use crate::protocol::{ArousalCategory, ProtocolTable};

fn obs(t: i64) -> Observation {
    Observation::new(t, 0.1)
}

#[test]
fn test_empty_observations_relax_toward_target() {
    let mut ukf = UkfStateEstimator::default();
    let protocols = ProtocolTable::builtin();
    ukf.set_protocol(protocols.get("4-7-8").unwrap());
    assert_eq!(ukf.target().arousal, 0.2);

    let start = ukf.belief().arousal;
    let mut belief = ukf.belief();
    for i in 0..600 {
        belief = ukf.update(&obs(i * 100), 0.1);
    }
    // 60 s of prediction only: arousal drifts down toward the calm target
    assert!(belief.arousal < start, "{} !< {}", belief.arousal, start);
    // and uncertainty grows without measurements
    assert!(belief.confidence < 1.0);
}

#[test]
fn test_high_heart_rate_raises_arousal() {
    let mut calm = UkfStateEstimator::default();
    let mut stressed = UkfStateEstimator::default();
    for i in 0..50 {
        calm.update(&obs(i * 100).with_heart_rate(55.0, 0.95), 0.1);
        stressed.update(&obs(i * 100).with_heart_rate(110.0, 0.95), 0.1);
    }
    assert!(stressed.belief().arousal > calm.belief().arousal + 0.2);
}

#[test]
fn test_confidence_inflates_heart_rate_noise() {
    let mut sure = UkfStateEstimator::default();
    let mut unsure = UkfStateEstimator::default();
    sure.update(&obs(0).with_heart_rate(90.0, 1.0), 0.1);
    unsure.update(&obs(0).with_heart_rate(90.0, 0.4), 0.1);
    // a noisier reading moves the mean less
    let base = UkfStateEstimator::default().update(&obs(0), 0.1).arousal;
    assert!((sure.belief().arousal - base).abs() > (unsure.belief().arousal - base).abs());
}

#[test]
fn test_all_channels_fuse() {
    let mut ukf = UkfStateEstimator::default();
    let b = ukf.update(
        &obs(0)
            .with_heart_rate(72.0, 0.9)
            .with_respiration(6.0)
            .with_stress_index(120.0)
            .with_valence(0.4),
        0.1,
    );
    assert_eq!(ukf.diagnostics().accepted_channels, 4);
    assert!(b.innovation >= 0.0);
    assert!(b.valence > 0.0);
}

#[test]
fn test_target_table() {
    let mut ukf = UkfStateEstimator::new(Some(UkfConfig::default()));
    ukf.set_target_category(ArousalCategory::Balanced);
    let t = ukf.target();
    assert_eq!((t.arousal, t.attention, t.rhythm, t.valence), (0.4, 0.7, 0.9, 0.5));
}

#[test]
fn test_prediction_error_is_rms_of_deviation() {
    let ukf = UkfStateEstimator::default();
    let b = ukf.belief();
    let t = ukf.target();
    let m = ukf.mean();
    let expected = (((m[0] - t.arousal).powi(2) + (m[4] - t.rhythm).powi(2)) / 2.0).sqrt();
    assert!((b.prediction_error as f64 - expected).abs() < 1e-6);
}

#[test]
fn test_zero_and_garbage_dt() {
    let mut ukf = UkfStateEstimator::default();
    let before = ukf.mean();
    ukf.update(&obs(0), 0.0);
    ukf.update(&obs(0), f32::NAN);
    ukf.update(&obs(0), -3.0);
    let after = ukf.mean();
    for (a, b) in before.iter().zip(after.iter()) {
        assert!((a - b).abs() < 1e-9);
    }
}
