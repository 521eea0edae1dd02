//! Centralized constants for the voice pipeline
//!
//! Single source of truth for default tunables. Settings defaults pull
//! from here so a value is never duplicated across crates.

/// Audio capture and playback
pub mod audio {
    /// Capture/processing sample rate (Hz)
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Fixed capture chunk duration (ms)
    pub const CHUNK_MS: u32 = 20;

    /// Chunks discarded after device open (microphone settling)
    pub const SETTLE_CHUNKS: u32 = 5;

    /// Silence sent before the first synthesized chunk of each
    /// speaking turn, so the hardware pipeline wakes without a click
    pub const LEAD_IN_SILENCE_MS: u32 = 60;

    /// A read is stale once this many chunk periods pass without data
    pub const STALENESS_MULTIPLE: u32 = 8;

    /// Consecutive playback failures before a device error is raised
    pub const MAX_PLAYBACK_FAILURES: u32 = 3;
}

/// Voice-activity segmentation (hysteresis window)
pub mod segmenter {
    /// Consecutive speech needed to confirm speech start (ms)
    pub const SPEECH_CONFIRM_MS: u32 = 200;

    /// Consecutive silence needed to confirm speech end (ms)
    pub const SILENCE_CONFIRM_MS: u32 = 800;

    /// Utterances shorter than this are discarded as noise (ms)
    pub const MIN_UTTERANCE_MS: u32 = 500;

    /// Energy floor for the fallback classifier (dB)
    pub const ENERGY_FLOOR_DB: f32 = -45.0;
}

/// Per-state dwell limits (ms)
pub mod timeouts {
    /// WakeDetected must hand off to speech capture quickly
    pub const WAKE_DETECTED_MS: u64 = 2_000;

    /// Maximum continuous speech capture
    pub const LISTENING_SPEECH_MS: u64 = 35_000;

    /// Commit + reasoning, including backend-internal tool calls
    pub const PROCESSING_MS: u64 = 90_000;

    /// Response playback
    pub const SPEAKING_MS: u64 = 180_000;
}

/// Failure recovery and backoff
pub mod recovery {
    /// Consecutive failures before a component is degraded or aborted
    pub const MAX_RETRIES: u32 = 5;

    /// First retry delay (ms)
    pub const INITIAL_DELAY_MS: u64 = 250;

    /// Exponential backoff factor
    pub const BACKOFF_FACTOR: f64 = 2.0;

    /// Backoff cap (ms)
    pub const MAX_DELAY_MS: u64 = 10_000;
}
