//! Stream health monitoring
//!
//! Detects hardware-level staleness: a capture stream that stops
//! delivering data, or a playback path that keeps failing. This layer
//! only detects and reports; retry policy belongs to the recovery
//! manager in the pipeline crate.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use companion_core::{Error, Result};

/// Tracks read recency and consecutive playback failures
pub struct HealthMonitor {
    chunk_period: Duration,
    staleness_multiple: u32,
    max_playback_failures: u32,
    last_read: Mutex<Instant>,
    playback_failures: AtomicU32,
}

impl HealthMonitor {
    pub fn new(chunk_period: Duration, staleness_multiple: u32, max_playback_failures: u32) -> Self {
        Self {
            chunk_period,
            staleness_multiple,
            max_playback_failures,
            last_read: Mutex::new(Instant::now()),
            playback_failures: AtomicU32::new(0),
        }
    }

    /// Maximum tolerated gap between successful reads
    pub fn staleness_limit(&self) -> Duration {
        self.chunk_period * self.staleness_multiple
    }

    /// Record a successful capture read
    pub fn record_read(&self) {
        *self.last_read.lock() = Instant::now();
    }

    /// Record a playback outcome
    pub fn record_playback(&self, ok: bool) {
        if ok {
            self.playback_failures.store(0, Ordering::Relaxed);
        } else {
            self.playback_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Time since the last successful read
    pub fn time_since_read(&self) -> Duration {
        self.last_read.lock().elapsed()
    }

    /// Raise a device error if the stream is stale or playback keeps
    /// failing. Never returns stale/zeroed data in place of an error.
    pub fn check(&self) -> Result<()> {
        let since_read = self.time_since_read();
        if since_read > self.staleness_limit() {
            return Err(Error::Device(format!(
                "no capture data for {:?} (limit {:?})",
                since_read,
                self.staleness_limit()
            )));
        }

        let failures = self.playback_failures.load(Ordering::Relaxed);
        if failures >= self.max_playback_failures {
            return Err(Error::Device(format!(
                "{} consecutive playback failures",
                failures
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_monitor_is_healthy() {
        let monitor = HealthMonitor::new(Duration::from_millis(20), 8, 3);
        assert!(monitor.check().is_ok());
    }

    #[test]
    fn test_playback_failures_raise_device_error() {
        let monitor = HealthMonitor::new(Duration::from_millis(20), 8, 3);
        monitor.record_playback(false);
        monitor.record_playback(false);
        assert!(monitor.check().is_ok());
        monitor.record_playback(false);
        assert!(matches!(monitor.check(), Err(Error::Device(_))));
    }

    #[test]
    fn test_playback_success_resets_failures() {
        let monitor = HealthMonitor::new(Duration::from_millis(20), 8, 3);
        monitor.record_playback(false);
        monitor.record_playback(false);
        monitor.record_playback(true);
        monitor.record_playback(false);
        assert!(monitor.check().is_ok());
    }

    #[test]
    fn test_stale_read_raises_device_error() {
        // 1ms period with multiple 2: stale after 2ms
        let monitor = HealthMonitor::new(Duration::from_millis(1), 2, 3);
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(monitor.check(), Err(Error::Device(_))));
        monitor.record_read();
        assert!(monitor.check().is_ok());
    }
}
