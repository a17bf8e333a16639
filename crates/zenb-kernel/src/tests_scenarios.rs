//! End-to-end session scenarios driven through the kernel

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::KernelConfig;
use crate::event::{EventKind, KernelEvent};
use crate::kernel::{DispatchOutcome, FollowUps, RuntimeKernel};
use crate::observation::Observation;
use crate::phase_machine::Phase;
use crate::safety::Severity;
use crate::state::{RuntimeState, Status};

const DT: f32 = 0.1;

fn kernel() -> RuntimeKernel {
    RuntimeKernel::new(KernelConfig::default()).unwrap()
}

/// Tick `seconds` worth of fixed steps with a steady heart rate
fn run(kernel: &mut RuntimeKernel, seconds: f32, hr: Option<f32>) {
    let steps = (seconds / DT).round() as usize;
    for _ in 0..steps {
        let now = kernel.get_state().now_ms;
        let obs = hr.map(|bpm| Observation::new(now, DT).with_heart_rate(bpm, 0.95));
        kernel.tick(DT, obs);
    }
}

#[test]
fn test_nominal_478_session() {
    let mut k = kernel();
    assert!(k.dispatch(KernelEvent::load_protocol(0, "4-7-8")).is_applied());
    assert!(k.dispatch(KernelEvent::start_session(0)).is_applied());
    assert_eq!(k.get_state().status, Status::Running);

    run(&mut k, 6.0, Some(62.0));
    let state = k.get_state();
    assert_eq!(state.phase, Phase::HoldIn);
    assert!((state.session_duration - 6.0).abs() < 1e-3);

    // a full 19 s cycle plus change
    run(&mut k, 14.0, Some(62.0));
    assert_eq!(k.get_state().cycle_count, 1);
    assert_eq!(k.get_state().phase, Phase::Inhale);

    let now = k.get_state().now_ms;
    assert!(k.dispatch(KernelEvent::halt(now, "stop")).is_applied());
    assert_eq!(k.get_state().status, Status::Halted);

    // nominal run: cycle-boundary obligation resolved without complaints
    assert!(k.violations().is_empty(), "{:?}", k.violations());
    assert_eq!(k.pending_obligations(), 0);
}

#[test]
fn test_panic_shielding() {
    let mut k = kernel();
    k.dispatch(KernelEvent::start_session(0));
    run(&mut k, 11.0, Some(160.0));

    k.state_mut().belief.prediction_error = 0.99;
    let now = k.get_state().now_ms;

    // anything but a halt is refused while panicking
    let out = k.dispatch(KernelEvent::new(now, EventKind::Pause));
    assert_eq!(
        out,
        DispatchOutcome::Rejected {
            property: "panic_halt".into()
        }
    );
    assert_eq!(k.get_state().status, Status::Running);

    assert!(k.dispatch(KernelEvent::emergency_halt(now)).is_applied());
    let state = k.get_state();
    assert_eq!(state.status, Status::SafetyLock);
    assert!(!state.is_session_active());
    assert_eq!(state.lock_reason.as_deref(), Some("emergency halt"));
}

#[test]
fn test_auto_interdiction_when_enabled() {
    let mut cfg = KernelConfig::default();
    cfg.runtime.auto_interdict = true;
    cfg.safety.panic_error_threshold = 0.0;
    cfg.safety.liveness_error_threshold = 0.0;
    let mut k = RuntimeKernel::new(cfg).unwrap();
    k.dispatch(KernelEvent::start_session(0));
    run(&mut k, 11.0, None);
    assert_eq!(k.get_state().status, Status::SafetyLock);
}

#[test]
fn test_tempo_shield() {
    let mut k = kernel();
    let out = k.dispatch(KernelEvent::adjust_tempo(0, 5.0, "ai"));
    assert_eq!(
        out,
        DispatchOutcome::Shielded {
            corrected: KernelEvent::adjust_tempo(0, 1.4, "ai")
        }
    );
    assert_eq!(k.get_state().tempo_scale, 1.4);

    let v = k.violations().back().unwrap();
    assert_eq!(v.severity, Severity::Critical);
    assert_eq!(v.property_name, "tempo_bounds");
    assert_eq!(v.event, Some(KernelEvent::adjust_tempo(0, 5.0, "ai")));
    assert_eq!(v.state.tempo_scale, 1.0);
}

#[test]
fn test_pause_freezes_session_time() {
    let mut k = kernel();
    k.dispatch(KernelEvent::start_session(0));
    run(&mut k, 5.0, Some(65.0));
    let phase_before = (k.get_state().phase, k.get_state().phase_elapsed);

    let now = k.get_state().now_ms;
    assert!(k.dispatch(KernelEvent::new(now, EventKind::Pause)).is_applied());
    run(&mut k, 60.0, Some(65.0));
    assert_eq!(
        (k.get_state().phase, k.get_state().phase_elapsed),
        phase_before
    );

    let now = k.get_state().now_ms;
    k.dispatch(KernelEvent::new(now, EventKind::Resume));
    assert_eq!(k.get_state().status, Status::Running);
    assert!((k.get_state().session_duration - 5.0).abs() < 0.05);
    // logical clock kept running
    assert_eq!(k.get_state().now_ms, 65_000);
}

#[test]
fn test_rejection_is_idempotent() {
    let mut k = kernel();
    k.dispatch(KernelEvent::start_session(0));
    k.dispatch(KernelEvent::emergency_halt(1_000));
    k.dispatch(KernelEvent::new(1_000, EventKind::ResetSafetyLock));
    let before = k.get_state().clone();

    let first = k.dispatch(KernelEvent::start_session(2_000));
    let after_first = k.get_state().clone();
    let second = k.dispatch(KernelEvent::start_session(2_000));

    assert_eq!(first, second);
    assert!(matches!(first, DispatchOutcome::Rejected { .. }));
    assert_eq!(before, after_first);
    assert_eq!(&after_first, k.get_state());
}

#[test]
fn test_protocol_cooldown_mid_session() {
    let mut k = kernel();
    k.dispatch(KernelEvent::load_protocol(0, "box"));
    k.dispatch(KernelEvent::start_session(0));

    let out = k.dispatch(KernelEvent::load_protocol(30_000, "calm"));
    assert_eq!(
        out,
        DispatchOutcome::Rejected {
            property: "protocol_cooldown".into()
        }
    );
    assert_eq!(k.get_state().protocol_id, "box");

    assert!(k.dispatch(KernelEvent::load_protocol(61_000, "calm")).is_applied());
    assert_eq!(k.get_state().protocol_id, "calm");
    assert_eq!(k.get_state().phase, Phase::Inhale);
}

/// Fill the safety trace past its capacity with harmless events
fn flood_trace(kernel: &mut RuntimeKernel, from_ms: i64) {
    let capacity = kernel.config().safety.trace_capacity as i64;
    for i in 0..=capacity {
        let ev = KernelEvent::new(from_ms + i, EventKind::VoiceActivity { active: i % 2 == 0 });
        assert!(kernel.dispatch(ev).is_applied());
    }
}

#[test]
fn test_tempo_rate_limit_survives_busy_trace() {
    let mut k = kernel();
    k.dispatch(KernelEvent::start_session(0));
    assert_eq!(
        k.dispatch(KernelEvent::adjust_tempo(0, 1.0, "ai")),
        DispatchOutcome::Accepted
    );
    flood_trace(&mut k, 1);
    assert!(k
        .monitor()
        .trace()
        .iter()
        .all(|e| !matches!(e.kind, EventKind::AdjustTempo { .. })));

    // 200 ms after the last adjustment only 0.02 of change is allowed
    let out = k.dispatch(KernelEvent::adjust_tempo(200, 1.4, "ai"));
    let DispatchOutcome::Shielded { corrected } = out else {
        panic!("expected a shielded tempo change, got {:?}", out);
    };
    assert_eq!(corrected.ts_ms, 200);
    assert!((k.get_state().tempo_scale - 1.02).abs() < 1e-4);
    assert_eq!(
        k.violations().back().unwrap().property_name,
        "tempo_rate_limit"
    );
}

#[test]
fn test_protocol_cooldown_survives_busy_trace() {
    let mut k = kernel();
    k.dispatch(KernelEvent::load_protocol(0, "box"));
    k.dispatch(KernelEvent::start_session(0));
    flood_trace(&mut k, 1);

    let out = k.dispatch(KernelEvent::load_protocol(30_000, "calm"));
    assert_eq!(
        out,
        DispatchOutcome::Rejected {
            property: "protocol_cooldown".into()
        }
    );
    assert_eq!(k.get_state().protocol_id, "box");
}

#[test]
fn test_panicking_subscriber_is_isolated() {
    let mut k = kernel();
    let healthy = Arc::new(AtomicUsize::new(0));

    let _bad = k.subscribe(|state: &RuntimeState| {
        if state.status == Status::Running {
            panic!("subscriber bug");
        }
    });
    let h = healthy.clone();
    let _good = k.subscribe(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    k.dispatch(KernelEvent::start_session(0));
    k.tick(DT, None);
    assert_eq!(healthy.load(Ordering::SeqCst), 3);
}

#[test]
fn test_unsubscribe_inside_callback() {
    let k = kernel();
    let slot: Arc<Mutex<Option<crate::kernel::Subscription>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));

    let (s, c) = (slot.clone(), calls.clone());
    let sub = k.subscribe(move |_| {
        if c.fetch_add(1, Ordering::SeqCst) == 1 {
            if let Some(sub) = s.lock().take() {
                sub.unsubscribe();
            }
        }
    });
    *slot.lock() = Some(sub);

    let mut k = k;
    k.tick(DT, None);
    k.tick(DT, None);
    k.tick(DT, None);
    // initial snapshot + first tick, then gone
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_middleware_follow_ups() {
    let mut k = kernel();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    k.use_middleware(
        move |ev: &KernelEvent,
              before: &RuntimeState,
              after: &RuntimeState,
              _: &mut FollowUps| {
            log.lock().push((ev.tag(), before.status, after.status));
        },
    );
    // starting a session asks the coach to connect
    k.use_middleware(
        |ev: &KernelEvent, _: &RuntimeState, after: &RuntimeState, fu: &mut FollowUps| {
            if matches!(ev.kind, EventKind::StartSession) && after.status == Status::Running {
                fu.dispatch(KernelEvent::new(
                    ev.ts_ms,
                    EventKind::AiStatusChanged {
                        status: crate::state::AiStatus::Connecting,
                    },
                ));
            }
        },
    );

    let out = k.dispatch(KernelEvent::start_session(0));
    assert_eq!(out, DispatchOutcome::Accepted);
    assert_eq!(k.get_state().ai_status, crate::state::AiStatus::Connecting);

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1, Status::Idle);
    assert_eq!(seen[0].2, Status::Running);
}

#[test]
fn test_runaway_follow_ups_are_bounded() {
    let mut k = kernel();
    k.use_middleware(
        |ev: &KernelEvent, _: &RuntimeState, _: &RuntimeState, fu: &mut FollowUps| {
            fu.dispatch(KernelEvent::new(
                ev.ts_ms + 1,
                EventKind::VoiceActivity { active: true },
            ));
        },
    );
    assert!(k.dispatch(KernelEvent::new(0, EventKind::Boot)).is_applied());
    assert!(k.get_state().voice_active);
}

#[test]
fn test_intervention_requires_session() {
    let mut k = kernel();
    let start = KernelEvent::new(0, EventKind::AiIntervention { kind: "breath-cue".into() });
    assert!(matches!(k.dispatch(start.clone()), DispatchOutcome::Rejected { .. }));
    assert!(k.get_state().active_intervention.is_none());

    k.dispatch(KernelEvent::start_session(0));
    assert!(k.dispatch(start).is_applied());
    assert_eq!(k.get_state().active_intervention.as_deref(), Some("breath-cue"));
    k.dispatch(KernelEvent::new(100, EventKind::AiInterventionEnded));
    assert!(k.get_state().active_intervention.is_none());
    assert_eq!(k.pending_obligations(), 0);
    assert!(k
        .violations()
        .iter()
        .all(|v| v.severity == Severity::Critical));
}
