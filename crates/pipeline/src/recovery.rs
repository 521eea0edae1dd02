//! Tiered failure recovery
//!
//! Tracks consecutive failures per component and decides between
//! retrying with exponential backoff, degrading the component (the
//! orchestrator then bypasses or substitutes that stage), and aborting
//! the pipeline. Counters reset on a component's next success; the
//! degraded flag does not, since one success after a failure streak is
//! often transient. Degraded flags clear only on explicit operator
//! reset.

use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use companion_config::RecoverySettings;
use companion_core::Component;

/// Decision for one recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-enter the last listening state after the backoff delay
    Retry { delay: Duration },
    /// Bypass the component from now on; keep the pipeline running
    Degrade,
    /// Force idle and surface the error to the caller
    Abort,
}

#[derive(Debug, Default)]
struct ComponentRecord {
    consecutive_failures: u32,
    last_attempt_at: Option<Instant>,
    degraded: bool,
}

/// Components that have a usable fallback. The others can only retry
/// or abort: there is no conversation without a speech channel or a
/// reasoning backend.
fn has_fallback(component: Component) -> bool {
    matches!(
        component,
        Component::WakeWord | Component::VoiceActivity | Component::AudioDevice
    )
}

pub struct RecoveryManager {
    settings: RecoverySettings,
    records: HashMap<Component, ComponentRecord>,
}

impl RecoveryManager {
    pub fn new(settings: RecoverySettings) -> Self {
        Self {
            settings,
            records: HashMap::new(),
        }
    }

    /// Record a failure and decide what to do about it
    pub fn record_failure(&mut self, component: Component) -> RecoveryAction {
        let max_retries = self.settings.max_retries;
        let record = self.records.entry(component).or_default();
        record.consecutive_failures += 1;
        record.last_attempt_at = Some(Instant::now());
        let failures = record.consecutive_failures;

        if failures <= max_retries {
            let delay = self.backoff_delay(failures - 1);
            tracing::warn!(
                component = %component,
                failures,
                delay_ms = delay.as_millis() as u64,
                "Component failure, retrying"
            );
            return RecoveryAction::Retry { delay };
        }

        let record = self.records.entry(component).or_default();
        if has_fallback(component) && !record.degraded {
            record.degraded = true;
            record.consecutive_failures = 0;
            tracing::warn!(component = %component, "Retry budget exhausted, degrading");
            return RecoveryAction::Degrade;
        }

        tracing::error!(component = %component, failures, "Retry budget exhausted, aborting");
        RecoveryAction::Abort
    }

    /// Reset the failure counter after a component success. The
    /// degraded flag is left as-is.
    pub fn record_success(&mut self, component: Component) {
        if let Some(record) = self.records.get_mut(&component) {
            if record.consecutive_failures > 0 {
                tracing::debug!(component = %component, "Component recovered");
                record.consecutive_failures = 0;
            }
        }
    }

    pub fn is_degraded(&self, component: Component) -> bool {
        self.records
            .get(&component)
            .map(|r| r.degraded)
            .unwrap_or(false)
    }

    /// Operator-driven reset of a degraded flag
    pub fn reset_degraded(&mut self, component: Component) {
        if let Some(record) = self.records.get_mut(&component) {
            if record.degraded {
                tracing::info!(component = %component, "Degraded flag reset");
                record.degraded = false;
                record.consecutive_failures = 0;
            }
        }
    }

    pub fn consecutive_failures(&self, component: Component) -> u32 {
        self.records
            .get(&component)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    /// True when no component has failures or a degraded flag
    pub fn is_clean(&self) -> bool {
        self.records
            .values()
            .all(|r| r.consecutive_failures == 0 && !r.degraded)
    }

    /// delay = min(max_delay, initial * factor^attempt), with a small
    /// jitter so synchronized failures do not retry in lockstep
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.initial_delay_ms as f64
            * self.settings.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.settings.max_delay_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        Duration::from_millis((capped * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_retries: u32) -> RecoveryManager {
        RecoveryManager::new(RecoverySettings {
            max_retries,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 1_000,
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut mgr = manager(20);
        let mut delays = Vec::new();
        for _ in 0..6 {
            match mgr.record_failure(Component::TranscriptionChannel) {
                RecoveryAction::Retry { delay } => delays.push(delay),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        // 100, 200, 400, 800, then capped at 1000 (within jitter)
        assert!(delays[1] > delays[0]);
        assert!(delays[2] > delays[1]);
        for delay in &delays[4..] {
            assert!(*delay <= Duration::from_millis(1_100));
        }
    }

    #[test]
    fn test_degrade_after_max_retries() {
        let mut mgr = manager(5);
        for _ in 0..5 {
            assert!(matches!(
                mgr.record_failure(Component::AudioDevice),
                RecoveryAction::Retry { .. }
            ));
        }
        assert_eq!(
            mgr.record_failure(Component::AudioDevice),
            RecoveryAction::Degrade
        );
        assert!(mgr.is_degraded(Component::AudioDevice));
    }

    #[test]
    fn test_degraded_flag_survives_success() {
        let mut mgr = manager(1);
        mgr.record_failure(Component::VoiceActivity);
        assert_eq!(
            mgr.record_failure(Component::VoiceActivity),
            RecoveryAction::Degrade
        );
        mgr.record_success(Component::VoiceActivity);
        assert!(mgr.is_degraded(Component::VoiceActivity));
        assert_eq!(mgr.consecutive_failures(Component::VoiceActivity), 0);
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let mut mgr = manager(3);
        mgr.record_failure(Component::ReasoningBackend);
        mgr.record_failure(Component::ReasoningBackend);
        mgr.record_success(Component::ReasoningBackend);
        assert_eq!(mgr.consecutive_failures(Component::ReasoningBackend), 0);
        // The streak starts over: next failure is attempt one again
        assert!(matches!(
            mgr.record_failure(Component::ReasoningBackend),
            RecoveryAction::Retry { .. }
        ));
    }

    #[test]
    fn test_no_fallback_components_abort() {
        let mut mgr = manager(1);
        mgr.record_failure(Component::TranscriptionChannel);
        assert_eq!(
            mgr.record_failure(Component::TranscriptionChannel),
            RecoveryAction::Abort
        );
        assert!(!mgr.is_degraded(Component::TranscriptionChannel));
    }

    #[test]
    fn test_degraded_component_failing_again_aborts() {
        let mut mgr = manager(1);
        mgr.record_failure(Component::WakeWord);
        assert_eq!(mgr.record_failure(Component::WakeWord), RecoveryAction::Degrade);
        // Still failing in degraded mode: retries again, then aborts
        mgr.record_failure(Component::WakeWord);
        assert_eq!(mgr.record_failure(Component::WakeWord), RecoveryAction::Abort);
    }

    #[test]
    fn test_reset_degraded() {
        let mut mgr = manager(1);
        mgr.record_failure(Component::WakeWord);
        mgr.record_failure(Component::WakeWord);
        assert!(mgr.is_degraded(Component::WakeWord));
        mgr.reset_degraded(Component::WakeWord);
        assert!(!mgr.is_degraded(Component::WakeWord));
        assert!(mgr.is_clean());
    }
}
