//! Observability hooks
//!
//! A single observer trait injected at construction replaces ad-hoc
//! callback wiring. All hooks are synchronous, optional (default to
//! no-ops), and must not block: they run on the orchestrator's own
//! task between state transitions.

use companion_core::{Component, Error};

use crate::state::PipelineState;

pub trait PipelineObserver: Send + Sync {
    fn on_state_change(&self, _from: PipelineState, _to: PipelineState) {}

    /// Transcript received from a committed utterance
    fn on_transcript(&self, _text: &str) {}

    /// Response text about to be synthesized
    fn on_response(&self, _text: &str) {}

    /// A component entered or left degraded mode
    fn on_degraded_mode_change(&self, _component: Component, _degraded: bool) {}

    /// An unrecoverable failure is aborting the pipeline
    fn on_error(&self, _error: &Error) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}
