//! External collaborator contracts
//!
//! The pipeline treats its ML models, network backends, and the motion
//! layer as black boxes behind these narrow interfaces. Production
//! implementations live outside this workspace; the audio crate
//! provides the device-backed `AudioIo`, and tests provide mocks.

use crate::audio::AudioChunk;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier of the wake-word model that fired
pub type WakeWordId = String;

/// Wake-word detector contract.
///
/// Stateless from the orchestrator's perspective; implementations may
/// hold internal audio buffers.
pub trait WakeWordDetector: Send + Sync {
    /// Feed one chunk; returns the model identifier on a detection
    fn process_chunk(&self, chunk: &AudioChunk) -> Result<Option<WakeWordId>>;
}

/// Per-chunk speech/non-speech decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechClass {
    Speech,
    NonSpeech,
}

/// Voice-activity classifier contract.
///
/// Consumed only by the segmenter, which owns the hysteresis state
/// machine around these raw per-chunk decisions.
pub trait SpeechClassifier: Send + Sync {
    fn classify(&self, chunk: &AudioChunk) -> Result<SpeechClass>;
}

/// Recognized transcript returned by a channel commit
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    /// Recognition confidence in [0.0, 1.0]
    pub confidence: f32,
}

/// One synthesized audio chunk with its motion amplitude
#[derive(Debug, Clone)]
pub struct SynthesisFrame {
    pub chunk: AudioChunk,
    /// Amplitude in [0.0, 1.0] forwarded to the motion sink
    pub amplitude: f32,
    /// Last frame of the utterance
    pub is_final: bool,
}

/// Streaming transcription/synthesis channel.
///
/// The orchestrator owns the channel lifecycle (open per voice, close
/// on persona switch or shutdown) but not its internal protocol.
#[async_trait]
pub trait SpeechChannel: Send {
    /// Stream one utterance chunk to the recognizer
    async fn send_audio(&mut self, chunk: &AudioChunk) -> Result<()>;

    /// Finalize the buffered utterance and await its transcript
    async fn commit(&mut self) -> Result<Transcript>;

    /// Synthesize a response; frames arrive on the returned receiver
    async fn synthesize(&mut self, text: &str) -> Result<mpsc::Receiver<SynthesisFrame>>;

    /// Close the channel, releasing backend resources
    async fn close(&mut self) -> Result<()>;

    /// Voice the channel was opened with
    fn voice_id(&self) -> &str;
}

/// Opens speech channels parameterized by synthesis voice
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, voice_id: &str) -> Result<Box<dyn SpeechChannel>>;
}

/// Input modality for the reasoning backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Voice,
}

/// Reasoning backend turning a transcript into a response.
///
/// May perform tool invocations internally; those are invisible here
/// beyond the longer processing latency they imply.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn process(&self, transcript: &str, modality: Modality) -> Result<String>;

    /// Replace the active system prompt (applied on persona switch)
    async fn set_prompt(&self, prompt: &str) -> Result<()>;
}

/// Physical motion layer. Fire-and-forget: failures are logged by the
/// implementation, never propagated into pipeline state.
pub trait MotionSink: Send + Sync {
    fn on_amplitude(&self, amplitude: f32);
    fn pause_idle_behavior(&self);
    fn resume_idle_behavior(&self);
}

/// Audio device abstraction.
///
/// `read_chunk` blocks up to a bounded multiple of one chunk period;
/// beyond that the device is considered stale and a device error is
/// returned rather than silence or repeated data.
#[async_trait]
pub trait AudioIo: Send + Sync {
    async fn read_chunk(&self) -> Result<AudioChunk>;

    async fn play_chunk(&self, chunk: &AudioChunk) -> Result<()>;

    /// Close both directions, releasing device handles
    async fn close(&self) -> Result<()>;

    /// Nominal duration of one capture chunk
    fn chunk_duration(&self) -> Duration;
}
