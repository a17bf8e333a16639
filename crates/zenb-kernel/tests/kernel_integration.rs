//! Public-API tests: a host drives the kernel the way an app shell would.

use std::sync::Arc;

use parking_lot::Mutex;
use zenb_kernel::{
    DispatchOutcome, EventKind, FixedStepDriver, KernelConfig, KernelError, KernelEvent,
    Observation, PatternRecommender, Phase, ProtocolTable, RuntimeKernel, RuntimeState,
    SafetyProfile, Severity, Status, TempoController,
};

fn boot() -> RuntimeKernel {
    RuntimeKernel::new(KernelConfig::default()).expect("default config boots")
}

#[test]
fn json_commands_drive_a_session() {
    let mut kernel = boot();
    let script = [
        r#"{"ts_ms": 0, "kind": {"type": "Boot"}}"#,
        r#"{"ts_ms": 0, "kind": {"type": "LoadProtocol", "protocol_id": "box"}}"#,
        r#"{"ts_ms": 0, "kind": {"type": "StartSession"}}"#,
    ];
    for line in script {
        let event = KernelEvent::from_json(line).expect("valid command");
        assert!(kernel.dispatch(event).is_applied());
    }
    assert_eq!(kernel.get_state().status, Status::Running);
    assert_eq!(kernel.get_state().protocol_id, "box");

    let bogus = KernelEvent::from_json(r#"{"ts_ms": 0, "kind": {"type": "Overdrive"}}"#);
    assert!(matches!(bogus, Err(KernelError::MalformedEvent(_))));
}

#[test]
fn driver_paces_kernel_at_fixed_rate() {
    let mut kernel = boot();
    let mut driver = FixedStepDriver::new(&kernel.config().runtime);
    kernel.dispatch(KernelEvent::start_session(0));

    // 60 fps frames for 5 seconds
    let mut ticks = 0;
    for _ in 0..300 {
        ticks += driver.drive(&mut kernel, 1.0 / 60.0, |k| {
            Some(Observation::new(k.get_state().now_ms, 0.1).with_heart_rate(64.0, 0.9))
        });
    }
    assert!((49..=50).contains(&ticks), "{} ticks", ticks);
    assert!(kernel.get_state().session_duration > 4.8);
    assert!(kernel.get_state().last_observation.is_some());

    // a 3 s stall only folds the capped number of ticks
    let before = kernel.get_state().now_ms;
    assert_eq!(driver.drive(&mut kernel, 3.0, |_| None), 5);
    assert_eq!(kernel.get_state().now_ms - before, 500);
}

#[test]
fn pid_loop_stays_inside_the_safety_envelope() {
    let mut kernel = boot();
    let safety = kernel.config().safety.clone();
    let mut driver = FixedStepDriver::new(&kernel.config().runtime);
    let mut controller = TempoController::default();
    kernel.dispatch(KernelEvent::start_session(0));

    let mut requests = 0;
    let mut last_applied: Option<(i64, f32)> = None;
    for _ in 0..(60 * 60) {
        driver.drive(&mut kernel, 1.0 / 60.0, |k| {
            Some(Observation::new(k.get_state().now_ms, 0.1).with_heart_rate(72.0, 0.9))
        });
        let Some(request) = controller.update(kernel.get_state()) else {
            continue;
        };
        requests += 1;
        let ts = request.ts_ms;
        let outcome = kernel.dispatch(request);
        let tempo = kernel.get_state().tempo_scale;
        assert!(tempo >= safety.tempo_min && tempo <= safety.tempo_max);
        if !outcome.is_applied() {
            continue;
        }
        if let Some((prev_ts, prev_tempo)) = last_applied {
            let elapsed = (ts - prev_ts) as f32 / 1000.0;
            assert!((tempo - prev_tempo).abs() <= safety.max_tempo_rate * elapsed + 1e-3);
        }
        last_applied = Some((ts, tempo));
    }
    assert!(requests > 0);

    let now = kernel.get_state().now_ms;
    kernel.dispatch(KernelEvent::halt(now, "done"));
    let summary = kernel.last_session().expect("halt summarizes the session");
    assert_eq!(summary.protocol_id, "4-7-8");
    assert_eq!(summary.cycles, kernel.get_state().cycle_count);
    assert!(summary.duration_sec > 59.0);
    assert!((summary.mean_heart_rate.unwrap() - 72.0).abs() < 1e-3);
}

#[test]
fn recommender_ranks_the_builtin_table() {
    let table = ProtocolTable::builtin();
    let mut recommender = PatternRecommender::new();
    let night = recommender.recommend(&table, 2, 3);
    assert_eq!(night.len(), 3);
    assert_eq!(night[0].protocol_id, "4-7-8");

    recommender.record("4-7-8");
    recommender.record("4-7-8");
    assert_ne!(
        recommender.top_recommendation(&table, 2).unwrap().protocol_id,
        "4-7-8"
    );
}

#[test]
fn subscriber_sees_every_published_state() {
    let mut kernel = boot();
    let statuses: Arc<Mutex<Vec<Status>>> = Arc::default();

    let sink = statuses.clone();
    let sub = kernel.subscribe(move |s: &RuntimeState| sink.lock().push(s.status));

    kernel.dispatch(KernelEvent::start_session(0));
    kernel.dispatch(KernelEvent::new(0, EventKind::Pause));
    kernel.dispatch(KernelEvent::new(0, EventKind::Resume));
    kernel.dispatch(KernelEvent::halt(0, "done"));
    assert!(sub.unsubscribe());
    kernel.dispatch(KernelEvent::start_session(0));

    assert_eq!(
        *statuses.lock(),
        vec![
            Status::Idle,
            Status::Running,
            Status::Paused,
            Status::Running,
            Status::Halted
        ]
    );
}

#[test]
fn loaded_registry_locks_protocol() {
    let mut kernel = boot();
    let mut profiles = std::collections::HashMap::new();
    profiles.insert(
        "4-7-8".to_string(),
        SafetyProfile {
            lock_until_ms: Some(10_000),
            ..Default::default()
        },
    );
    kernel.dispatch(KernelEvent::new(0, EventKind::LoadSafetyRegistry { profiles }));

    let out = kernel.dispatch(KernelEvent::start_session(5_000));
    assert_eq!(
        out,
        DispatchOutcome::Rejected {
            property: "protocol_lock".into()
        }
    );
    let v = kernel.violations().back().unwrap();
    assert_eq!(v.severity, Severity::Critical);
    assert_eq!(v.state.status, Status::Idle);

    // another protocol is unaffected
    kernel.dispatch(KernelEvent::load_protocol(5_000, "coherence"));
    assert!(kernel.dispatch(KernelEvent::start_session(5_000)).is_applied());
}

#[test]
fn zero_duration_phases_are_skipped() {
    let mut kernel = boot();
    kernel.dispatch(KernelEvent::load_protocol(0, "coherence"));
    kernel.dispatch(KernelEvent::start_session(0));

    let mut seen = Vec::new();
    for _ in 0..100 {
        kernel.tick(0.1, None);
        let phase = kernel.get_state().phase;
        if seen.last() != Some(&phase) {
            seen.push(phase);
        }
    }
    assert!(!seen.contains(&Phase::HoldIn));
    assert!(!seen.contains(&Phase::HoldOut));
    assert_eq!(kernel.get_state().cycle_count, 1);
}

#[test]
fn layered_config_with_env_style_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.toml");
    std::fs::write(&path, "[safety]\ntempo_max = 1.2\n").unwrap();

    let mut cfg = KernelConfig::from_file(&path).unwrap();
    cfg.apply_overrides_from(|key| match key {
        "ZENB_RUNTIME_DEFAULT_PROTOCOL" => Some("box".to_string()),
        _ => None,
    })
    .unwrap();

    let mut kernel = RuntimeKernel::new(cfg).unwrap();
    assert_eq!(kernel.get_state().protocol_id, "box");
    let out = kernel.dispatch(KernelEvent::adjust_tempo(0, 1.4, "ai"));
    assert_eq!(
        out,
        DispatchOutcome::Shielded {
            corrected: KernelEvent::adjust_tempo(0, 1.2, "ai")
        }
    );
}

#[test]
fn invalid_config_refuses_to_boot() {
    let mut cfg = KernelConfig::default();
    cfg.safety.tempo_min = 2.0;
    assert!(matches!(
        RuntimeKernel::new(cfg),
        Err(KernelError::Config(_))
    ));
}

#[test]
fn shipped_config_matches_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/kernel.toml");
    let cfg = KernelConfig::load_layered(Some(std::path::Path::new(path)), None).unwrap();
    let defaults = KernelConfig::default();
    assert_eq!(cfg.safety.tempo_max, defaults.safety.tempo_max);
    assert_eq!(cfg.runtime.default_protocol, defaults.runtime.default_protocol);
    assert_eq!(
        cfg.estimator.max_covariance_resets,
        defaults.estimator.max_covariance_resets
    );
}
