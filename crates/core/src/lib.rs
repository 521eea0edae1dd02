//! Core types and collaborator contracts for the voice pipeline
//!
//! This crate provides the foundational types used across the
//! workspace:
//! - Audio chunk and utterance buffer types
//! - The error taxonomy with per-component attribution
//! - Contracts for the external collaborators (wake-word detector,
//!   voice-activity classifier, speech channel, reasoning backend,
//!   motion sink, audio device)

pub mod audio;
pub mod error;
pub mod traits;

pub use audio::{AudioChunk, SampleRate, UtteranceBuffer};
pub use error::{Component, Error, Result};
pub use traits::{
    AudioIo, ChannelFactory, Modality, MotionSink, ReasoningBackend, SpeechChannel,
    SpeechClass, SpeechClassifier, SynthesisFrame, Transcript, WakeWordDetector, WakeWordId,
};
