//! Error taxonomy for the voice pipeline
//!
//! Recoverable errors carry the component they originated from so the
//! recovery manager can track per-component failure counts. Config
//! errors are fatal at construction time and never caught at runtime.

use std::time::Duration;
use thiserror::Error;

/// Named pipeline components tracked by the recovery manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    WakeWord,
    VoiceActivity,
    TranscriptionChannel,
    AudioDevice,
    ReasoningBackend,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Component::WakeWord => "wake_word",
            Component::VoiceActivity => "voice_activity",
            Component::TranscriptionChannel => "transcription_channel",
            Component::AudioDevice => "audio_device",
            Component::ReasoningBackend => "reasoning_backend",
        };
        f.write_str(name)
    }
}

/// Pipeline error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Hardware/stream staleness or failure
    #[error("audio device error: {0}")]
    Device(String),

    /// Wake-word or voice-activity classifier failure
    #[error("detection error in {component}: {message}")]
    Detection { component: Component, message: String },

    /// Transcription/synthesis channel open/send/commit failure
    #[error("channel error: {0}")]
    Channel(String),

    /// Reasoning backend failure
    #[error("backend error: {0}")]
    Backend(String),

    /// State dwell time exceeded its policy limit
    #[error("timeout in state {state} after {elapsed:?}")]
    Timeout {
        state: &'static str,
        elapsed: Duration,
        component: Component,
    },

    /// Invalid configuration at load time. Fatal; fails construction.
    #[error("config error: {0}")]
    Config(String),

    /// Illegal state-machine edge. A programming error caught by the
    /// transition table, never silently ignored.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl Error {
    /// Originating component, used to route recoverable errors to the
    /// recovery manager. Config errors have no component: they are
    /// never recovered from.
    pub fn component(&self) -> Option<Component> {
        match self {
            Error::Device(_) => Some(Component::AudioDevice),
            Error::Detection { component, .. } => Some(*component),
            Error::Channel(_) => Some(Component::TranscriptionChannel),
            Error::Backend(_) => Some(Component::ReasoningBackend),
            Error::Timeout { component, .. } => Some(*component),
            Error::Config(_) | Error::InvalidTransition { .. } => None,
        }
    }

    /// True for errors the recovery manager may retry or degrade
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
