//! Pipeline states, the transition table, and the dwell-time policy
//!
//! Exactly one state is active at a time and only the orchestrator
//! mutates it, through a single transition function that validates the
//! edge against the table below. Illegal edges are rejected with an
//! error, never silently ignored.

use std::time::Duration;

use companion_config::TimeoutSettings;
use companion_core::Component;

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Not running; devices released
    Idle,
    /// Streaming chunks into the wake-word detector
    ListeningWake,
    /// Wake word hit; preparing the speech channel
    WakeDetected,
    /// Capturing an utterance, chunk by chunk
    ListeningSpeech,
    /// Committed; awaiting transcript and reasoning response
    Processing,
    /// Streaming synthesized audio to the speaker
    Speaking,
    /// A stage failed; awaiting the recovery decision
    Error,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::ListeningWake => "listening_wake",
            PipelineState::WakeDetected => "wake_detected",
            PipelineState::ListeningSpeech => "listening_speech",
            PipelineState::Processing => "processing",
            PipelineState::Speaking => "speaking",
            PipelineState::Error => "error",
        }
    }

    /// All states, for table-coverage tests
    pub const ALL: [PipelineState; 7] = [
        PipelineState::Idle,
        PipelineState::ListeningWake,
        PipelineState::WakeDetected,
        PipelineState::ListeningSpeech,
        PipelineState::Processing,
        PipelineState::Speaking,
        PipelineState::Error,
    ];
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The fixed transition table. Edges not listed here are illegal.
pub fn is_valid_transition(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState::*;
    matches!(
        (from, to),
        (Idle, ListeningWake)
            | (ListeningWake, WakeDetected)
            // Wake-word stage degraded: capture without a wake word
            | (ListeningWake, ListeningSpeech)
            | (ListeningWake, Idle)
            | (ListeningWake, Error)
            | (WakeDetected, ListeningSpeech)
            // Channel setup timed out; drop back to listening
            | (WakeDetected, ListeningWake)
            | (WakeDetected, Error)
            | (ListeningSpeech, Processing)
            // Empty or sub-minimum utterance discarded as noise
            | (ListeningSpeech, ListeningWake)
            | (ListeningSpeech, Idle)
            | (ListeningSpeech, Error)
            | (Processing, Speaking)
            // Empty reasoning response; nothing to say
            | (Processing, ListeningWake)
            | (Processing, Idle)
            | (Processing, Error)
            | (Speaking, ListeningWake)
            | (Speaking, Error)
            | (Error, ListeningWake)
            | (Error, Idle)
    )
}

/// Maximum dwell duration per state.
///
/// Resting states (`Idle`, `ListeningWake`, `Error`) have no limit:
/// the pipeline may listen for a wake word indefinitely, and `Error`
/// is exited by the recovery decision, not by time. Every other state
/// must have a finite timeout; tests enforce this.
#[derive(Debug, Clone)]
pub struct StateTimeoutPolicy {
    pub wake_detected: Duration,
    pub listening_speech: Duration,
    pub processing: Duration,
    pub speaking: Duration,
}

impl StateTimeoutPolicy {
    pub fn from_settings(timeouts: &TimeoutSettings) -> Self {
        Self {
            wake_detected: Duration::from_millis(timeouts.wake_detected_ms),
            listening_speech: Duration::from_millis(timeouts.listening_speech_ms),
            processing: Duration::from_millis(timeouts.processing_ms),
            speaking: Duration::from_millis(timeouts.speaking_ms),
        }
    }

    /// Dwell limit for a state; `None` for resting states
    pub fn timeout_for(&self, state: PipelineState) -> Option<Duration> {
        match state {
            PipelineState::WakeDetected => Some(self.wake_detected),
            PipelineState::ListeningSpeech => Some(self.listening_speech),
            PipelineState::Processing => Some(self.processing),
            PipelineState::Speaking => Some(self.speaking),
            PipelineState::Idle | PipelineState::ListeningWake | PipelineState::Error => None,
        }
    }

    /// Component a dwell-time violation in this state is attributed to
    pub fn timeout_component(state: PipelineState) -> Component {
        match state {
            // No speech end within the capture window
            PipelineState::ListeningSpeech => Component::VoiceActivity,
            // Reasoning is the long pole of the processing stage;
            // commit awaits carry their own channel attribution
            PipelineState::Processing => Component::ReasoningBackend,
            // Setup and playback both stall on the speech channel
            PipelineState::WakeDetected | PipelineState::Speaking => {
                Component::TranscriptionChannel
            },
            PipelineState::Idle | PipelineState::ListeningWake | PipelineState::Error => {
                Component::AudioDevice
            },
        }
    }
}
