//! Audio device manager
//!
//! Owns the microphone and speaker behind the [`AudioIo`] contract:
//! fixed-size capture chunks with monotonic sequence numbers, playback
//! of synthesized chunks, sample-rate conversion between the device
//! native rate and the pipeline processing rate, and stream health
//! monitoring.
//!
//! The device handles are shared-mode (cpal's default), never
//! exclusive, so a co-resident process using the same hardware (e.g. a
//! motor-control daemon playing short cues) is not starved.
//!
//! [`AudioIo`]: companion_core::AudioIo

pub mod device;
pub mod health;

pub use device::DeviceAudio;
pub use health::HealthMonitor;
