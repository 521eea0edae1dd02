//! Main settings module
//!
//! Settings are loaded once at startup from an optional file plus
//! `COMPANION__` environment overrides, validated, and treated as
//! immutable for the process lifetime.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{audio, recovery, segmenter, timeouts};
use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Audio device configuration
    #[serde(default)]
    pub audio: AudioSettings,

    /// Voice-activity segmentation thresholds
    #[serde(default)]
    pub segmenter: SegmenterSettings,

    /// Per-state dwell limits
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Retry/backoff parameters
    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Persona table location and default persona
    #[serde(default)]
    pub personas: PersonaSettings,
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Processing sample rate (Hz); devices are resampled to this
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Capture chunk duration (ms)
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u32,

    /// Chunks discarded after device open
    #[serde(default = "default_settle_chunks")]
    pub settle_chunks: u32,

    /// Silence prefix before each speaking turn (ms)
    #[serde(default = "default_lead_in_ms")]
    pub lead_in_silence_ms: u32,

    /// Chunk periods without a read before the device is stale
    #[serde(default = "default_staleness_multiple")]
    pub staleness_multiple: u32,

    /// Consecutive playback failures before a device error
    #[serde(default = "default_max_playback_failures")]
    pub max_playback_failures: u32,
}

fn default_sample_rate() -> u32 {
    audio::SAMPLE_RATE
}
fn default_chunk_ms() -> u32 {
    audio::CHUNK_MS
}
fn default_settle_chunks() -> u32 {
    audio::SETTLE_CHUNKS
}
fn default_lead_in_ms() -> u32 {
    audio::LEAD_IN_SILENCE_MS
}
fn default_staleness_multiple() -> u32 {
    audio::STALENESS_MULTIPLE
}
fn default_max_playback_failures() -> u32 {
    audio::MAX_PLAYBACK_FAILURES
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            chunk_ms: default_chunk_ms(),
            settle_chunks: default_settle_chunks(),
            lead_in_silence_ms: default_lead_in_ms(),
            staleness_multiple: default_staleness_multiple(),
            max_playback_failures: default_max_playback_failures(),
        }
    }
}

impl AudioSettings {
    /// Duration of one capture chunk
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_ms as u64)
    }
}

/// Voice-activity segmentation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterSettings {
    /// Consecutive speech needed to confirm speech start (ms)
    #[serde(default = "default_speech_confirm_ms")]
    pub speech_confirm_ms: u32,

    /// Consecutive silence needed to confirm speech end (ms)
    #[serde(default = "default_silence_confirm_ms")]
    pub silence_confirm_ms: u32,

    /// Utterances below this duration are rejected as noise (ms)
    #[serde(default = "default_min_utterance_ms")]
    pub min_utterance_ms: u32,

    /// Energy floor for the fallback classifier (dB)
    #[serde(default = "default_energy_floor_db")]
    pub energy_floor_db: f32,
}

fn default_speech_confirm_ms() -> u32 {
    segmenter::SPEECH_CONFIRM_MS
}
fn default_silence_confirm_ms() -> u32 {
    segmenter::SILENCE_CONFIRM_MS
}
fn default_min_utterance_ms() -> u32 {
    segmenter::MIN_UTTERANCE_MS
}
fn default_energy_floor_db() -> f32 {
    segmenter::ENERGY_FLOOR_DB
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            speech_confirm_ms: default_speech_confirm_ms(),
            silence_confirm_ms: default_silence_confirm_ms(),
            min_utterance_ms: default_min_utterance_ms(),
            energy_floor_db: default_energy_floor_db(),
        }
    }
}

/// Per-state dwell limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_wake_detected_ms")]
    pub wake_detected_ms: u64,

    #[serde(default = "default_listening_speech_ms")]
    pub listening_speech_ms: u64,

    #[serde(default = "default_processing_ms")]
    pub processing_ms: u64,

    #[serde(default = "default_speaking_ms")]
    pub speaking_ms: u64,
}

fn default_wake_detected_ms() -> u64 {
    timeouts::WAKE_DETECTED_MS
}
fn default_listening_speech_ms() -> u64 {
    timeouts::LISTENING_SPEECH_MS
}
fn default_processing_ms() -> u64 {
    timeouts::PROCESSING_MS
}
fn default_speaking_ms() -> u64 {
    timeouts::SPEAKING_MS
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            wake_detected_ms: default_wake_detected_ms(),
            listening_speech_ms: default_listening_speech_ms(),
            processing_ms: default_processing_ms(),
            speaking_ms: default_speaking_ms(),
        }
    }
}

/// Retry/backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    recovery::MAX_RETRIES
}
fn default_initial_delay_ms() -> u64 {
    recovery::INITIAL_DELAY_MS
}
fn default_backoff_factor() -> f64 {
    recovery::BACKOFF_FACTOR
}
fn default_max_delay_ms() -> u64 {
    recovery::MAX_DELAY_MS
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Persona table location and default persona
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaSettings {
    /// YAML persona table
    #[serde(default = "default_table_path")]
    pub table_path: PathBuf,

    /// Trusted directory all prompt paths must resolve inside
    #[serde(default = "default_prompt_dir")]
    pub prompt_dir: PathBuf,

    /// Persona active at startup, by name
    #[serde(default = "default_persona")]
    pub default_persona: String,
}

fn default_table_path() -> PathBuf {
    PathBuf::from("config/personas.yaml")
}
fn default_prompt_dir() -> PathBuf {
    PathBuf::from("config/prompts")
}
fn default_persona() -> String {
    "luna".to_string()
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            table_path: default_table_path(),
            prompt_dir: default_prompt_dir(),
            default_persona: default_persona(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings. Any violation is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_audio()?;
        self.validate_segmenter()?;
        self.validate_timeouts()?;
        self.validate_recovery()?;
        Ok(())
    }

    fn validate_audio(&self) -> Result<(), ConfigError> {
        if companion_core::SampleRate::from_u32(self.audio.sample_rate).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "audio.sample_rate".to_string(),
                message: format!("Unsupported sample rate {}", self.audio.sample_rate),
            });
        }

        if !(5..=100).contains(&self.audio.chunk_ms) {
            return Err(ConfigError::InvalidValue {
                field: "audio.chunk_ms".to_string(),
                message: format!("Chunk duration must be 5-100ms, got {}", self.audio.chunk_ms),
            });
        }

        if self.audio.staleness_multiple < 2 {
            return Err(ConfigError::InvalidValue {
                field: "audio.staleness_multiple".to_string(),
                message: "Staleness multiple below 2 flags healthy reads as stale".to_string(),
            });
        }

        Ok(())
    }

    fn validate_segmenter(&self) -> Result<(), ConfigError> {
        let s = &self.segmenter;

        if s.speech_confirm_ms < self.audio.chunk_ms {
            return Err(ConfigError::InvalidValue {
                field: "segmenter.speech_confirm_ms".to_string(),
                message: "Speech confirmation shorter than one chunk".to_string(),
            });
        }

        if s.silence_confirm_ms < self.audio.chunk_ms {
            return Err(ConfigError::InvalidValue {
                field: "segmenter.silence_confirm_ms".to_string(),
                message: "Silence confirmation shorter than one chunk".to_string(),
            });
        }

        if s.min_utterance_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "segmenter.min_utterance_ms".to_string(),
                message: "Minimum utterance duration must be non-zero".to_string(),
            });
        }

        if !s.energy_floor_db.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "segmenter.energy_floor_db".to_string(),
                message: "Energy floor must be finite".to_string(),
            });
        }

        Ok(())
    }

    /// Every non-terminal, non-idle state must have a finite timeout
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        for (field, value) in [
            ("timeouts.wake_detected_ms", t.wake_detected_ms),
            ("timeouts.listening_speech_ms", t.listening_speech_ms),
            ("timeouts.processing_ms", t.processing_ms),
            ("timeouts.speaking_ms", t.speaking_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "State timeout must be non-zero".to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_recovery(&self) -> Result<(), ConfigError> {
        let r = &self.recovery;

        if r.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "recovery.max_retries".to_string(),
                message: "At least one retry attempt is required".to_string(),
            });
        }

        if !r.backoff_factor.is_finite() || r.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "recovery.backoff_factor".to_string(),
                message: format!("Backoff factor must be >= 1.0, got {}", r.backoff_factor),
            });
        }

        if r.max_delay_ms < r.initial_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "recovery.max_delay_ms".to_string(),
                message: "Backoff cap below the initial delay".to_string(),
            });
        }

        Ok(())
    }
}

/// Load settings from an optional file plus environment overrides.
///
/// Priority: env vars (`COMPANION__` prefix) > the named file > built-in
/// defaults.
pub fn load_settings(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path));
    }

    let config = builder
        .add_source(Environment::with_prefix("COMPANION").separator("__"))
        .build()?;

    let settings: Settings = config.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
