//! Shield corrections.
//!
//! An event that fails a hard property may know how to turn itself into the
//! nearest safe equivalent. Events without a correction are rejected.

use crate::event::{EventKind, KernelEvent};

/// Limits a correction must respect
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShieldContext {
    pub current_tempo: f32,
    pub tempo_min: f32,
    pub tempo_max: f32,
    pub max_tempo_rate: f32,
    /// Seconds since the last accepted AdjustTempo, if any
    pub since_last_tempo_sec: Option<f32>,
}

pub trait Correctable: Sized {
    /// Nearest safe equivalent, or `None` if no correction exists
    fn correct(&self, ctx: &ShieldContext) -> Option<Self>;
}

impl Correctable for KernelEvent {
    fn correct(&self, ctx: &ShieldContext) -> Option<Self> {
        match &self.kind {
            EventKind::AdjustTempo { scale, reason } => {
                let scale = shield_tempo(*scale, ctx)?;
                Some(KernelEvent::new(
                    self.ts_ms,
                    EventKind::AdjustTempo {
                        scale,
                        reason: reason.clone(),
                    },
                ))
            }
            _ => None,
        }
    }
}

/// Clamp into the hard bound, then clamp the step to rate x elapsed
pub fn shield_tempo(requested: f32, ctx: &ShieldContext) -> Option<f32> {
    if !requested.is_finite() {
        return None;
    }
    let bounded = requested.clamp(ctx.tempo_min, ctx.tempo_max);
    let Some(elapsed) = ctx.since_last_tempo_sec else {
        return Some(bounded);
    };
    let max_step = ctx.max_tempo_rate * elapsed.max(0.0);
    let step = (bounded - ctx.current_tempo).clamp(-max_step, max_step);
    Some((ctx.current_tempo + step).clamp(ctx.tempo_min, ctx.tempo_max))
}
