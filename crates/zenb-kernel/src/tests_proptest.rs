use proptest::prelude::*;

/// Property-based invariants for the kernel: tempo bounds, rate limit,
/// estimator boundedness and covariance health under random inputs.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::estimators::UkfStateEstimator;
    use crate::event::{EventKind, KernelEvent};
    use crate::kernel::RuntimeKernel;
    use crate::observation::Observation;
    use crate::state::Status;

    fn arb_observation() -> impl Strategy<Value = Observation> {
        (
            proptest::option::of((20.0f32..260.0, 0.0f32..1.0)),
            proptest::option::of(0.0f32..70.0),
            proptest::option::of(-50.0f32..800.0),
            proptest::option::of(-1.5f32..1.5),
            any::<bool>(),
        )
            .prop_map(|(hr, rr, si, val, visible)| {
                let mut o = Observation::new(0, 0.1);
                o.heart_rate = hr.map(|(bpm, confidence)| crate::observation::HeartRateReading {
                    bpm,
                    confidence,
                });
                o.respiration_rate = rr;
                o.stress_index = si;
                o.facial_valence = val;
                o.visible = visible;
                o.sanitized()
            })
    }

    // =========================================================================
    // Test 1: Estimator boundedness and covariance floor
    // =========================================================================
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_estimator_stays_bounded(
            stream in proptest::collection::vec(arb_observation(), 1..80),
            dt in 0.0f32..2.0,
        ) {
            let mut ukf = UkfStateEstimator::default();
            for obs in &stream {
                let b = ukf.update(obs, dt);
                prop_assert!((0.0..=1.0).contains(&b.arousal));
                prop_assert!((0.0..=1.0).contains(&b.attention));
                prop_assert!((0.0..=1.0).contains(&b.rhythm_alignment));
                prop_assert!((-1.0..=1.0).contains(&b.valence));
                prop_assert!((0.0..=1.0).contains(&b.confidence));
                prop_assert!(b.prediction_error >= 0.0 && b.prediction_error.is_finite());
                prop_assert!(b.innovation.is_finite());

                let p = ukf.covariance();
                let floor = ukf.config().variance_floor;
                for i in 0..5 {
                    prop_assert!(p[i][i] >= floor);
                    for j in 0..5 {
                        prop_assert!(p[i][j].is_finite());
                        prop_assert!((p[i][j] - p[j][i]).abs() < 1e-12);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Test 2: Forced non-PD covariance never leaks NaN
    // =========================================================================
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_recovery_from_broken_covariance(
            junk in proptest::array::uniform5(-10.0f64..10.0),
            obs in arb_observation(),
        ) {
            let mut ukf = UkfStateEstimator::default();
            let mut p = [[0.0; 5]; 5];
            for i in 0..5 {
                for j in 0..5 {
                    p[i][j] = junk[(i + j) % 5];
                }
            }
            ukf.force_covariance(p);
            let b = ukf.update(&obs, 0.1);
            prop_assert!(b.arousal.is_finite() && b.confidence.is_finite());
            let cov = ukf.covariance();
            for i in 0..5 {
                prop_assert!(cov[i][i] >= ukf.config().variance_floor);
            }
        }
    }

    // =========================================================================
    // Test 3: Tempo invariant and rate limit across random commands
    // =========================================================================
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_tempo_bounds_and_rate(
            requests in proptest::collection::vec((-5.0f32..10.0, 0i64..5_000), 1..30),
        ) {
            let mut kernel = RuntimeKernel::new(KernelConfig::default()).unwrap();
            let cfg = kernel.config().safety.clone();
            kernel.dispatch(KernelEvent::start_session(0));

            let mut ts = 0i64;
            let mut last_accepted: Option<(i64, f32)> = None;
            for (scale, gap) in requests {
                ts += gap;
                let outcome = kernel.dispatch(KernelEvent::adjust_tempo(ts, scale, "prop"));
                let tempo = kernel.get_state().tempo_scale;
                prop_assert!(tempo >= cfg.tempo_min && tempo <= cfg.tempo_max);
                if !outcome.is_applied() {
                    continue;
                }

                if let Some((prev_ts, prev_tempo)) = last_accepted {
                    let elapsed = (ts - prev_ts) as f32 / 1000.0;
                    prop_assert!(
                        (tempo - prev_tempo).abs() <= cfg.max_tempo_rate * elapsed + 1e-3,
                        "rate exceeded: {} -> {} in {}s", prev_tempo, tempo, elapsed
                    );
                }
                last_accepted = Some((ts, tempo));
            }
        }
    }

    // =========================================================================
    // Test 4: SafetyLock is sticky until reset
    // =========================================================================
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_safety_lock_is_sticky(attempts in 1usize..20, gap in 0i64..1_000_000) {
            let mut kernel = RuntimeKernel::new(KernelConfig::default()).unwrap();
            kernel.dispatch(KernelEvent::start_session(0));
            kernel.dispatch(KernelEvent::emergency_halt(0));

            let mut ts = 0;
            for _ in 0..attempts {
                ts += gap;
                kernel.dispatch(KernelEvent::start_session(ts));
                kernel.dispatch(KernelEvent::new(ts, EventKind::Resume));
                prop_assert_eq!(kernel.get_state().status, Status::SafetyLock);
            }

            kernel.dispatch(KernelEvent::new(ts, EventKind::ResetSafetyLock));
            prop_assert_eq!(kernel.get_state().status, Status::Idle);
        }
    }
}
