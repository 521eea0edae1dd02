//! Voice-activity segmentation
//!
//! Wraps a per-chunk speech/non-speech classifier in a hysteresis
//! state machine: a speech start is confirmed only after enough
//! consecutive speech chunks, and a speech end only after enough
//! consecutive silence. The dual thresholds prevent classifier flicker
//! from producing spurious turn boundaries.

use std::sync::Arc;
use std::time::Duration;

use companion_config::SegmenterSettings;
use companion_core::{AudioChunk, Result, SpeechClass, SpeechClassifier};

/// Discrete events emitted by the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Speech confirmed after the configured run of speech chunks
    SpeechStart,
    /// Silence confirmed after the configured run of silent chunks.
    /// Carries the total speech time of the utterance, used for the
    /// minimum-duration noise rejection.
    SpeechEnd { speech: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingSpeech,
    InSpeech,
}

/// Hysteresis state machine around a [`SpeechClassifier`].
///
/// Thresholds are configured in milliseconds and converted to chunk
/// counts using the fixed chunk duration, so the machine itself only
/// counts consecutive classifications.
pub struct Segmenter {
    classifier: Arc<dyn SpeechClassifier>,
    chunk_ms: u32,
    speech_confirm_chunks: u32,
    silence_confirm_chunks: u32,
    min_utterance: Duration,
    phase: Phase,
    consecutive_speech: u32,
    consecutive_silence: u32,
    speech_chunks: u32,
}

impl Segmenter {
    pub fn new(
        classifier: Arc<dyn SpeechClassifier>,
        settings: &SegmenterSettings,
        chunk_ms: u32,
    ) -> Self {
        // Settings validation guarantees thresholds >= one chunk
        Self {
            classifier,
            chunk_ms,
            speech_confirm_chunks: (settings.speech_confirm_ms / chunk_ms).max(1),
            silence_confirm_chunks: (settings.silence_confirm_ms / chunk_ms).max(1),
            min_utterance: Duration::from_millis(settings.min_utterance_ms as u64),
            phase: Phase::AwaitingSpeech,
            consecutive_speech: 0,
            consecutive_silence: 0,
            speech_chunks: 0,
        }
    }

    /// Swap the classifier, keeping hysteresis state. Used when the
    /// primary detector is degraded and the energy fallback takes over.
    pub fn set_classifier(&mut self, classifier: Arc<dyn SpeechClassifier>) {
        self.classifier = classifier;
    }

    /// Reset to awaiting-speech at the start of a capture window
    pub fn reset(&mut self) {
        self.phase = Phase::AwaitingSpeech;
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.speech_chunks = 0;
    }

    /// Chunks needed to confirm a speech start
    pub fn speech_confirm_chunks(&self) -> u32 {
        self.speech_confirm_chunks
    }

    /// Chunks of silence needed to confirm a speech end
    pub fn silence_confirm_chunks(&self) -> u32 {
        self.silence_confirm_chunks
    }

    /// Classify one chunk and advance the hysteresis machine
    pub fn process(&mut self, chunk: &AudioChunk) -> Result<Option<SegmentEvent>> {
        let class = self.classifier.classify(chunk)?;

        let event = match (self.phase, class) {
            (Phase::AwaitingSpeech, SpeechClass::Speech) => {
                self.consecutive_speech += 1;
                if self.consecutive_speech >= self.speech_confirm_chunks {
                    self.phase = Phase::InSpeech;
                    self.consecutive_silence = 0;
                    self.speech_chunks = self.consecutive_speech;
                    tracing::debug!(
                        confirm_chunks = self.speech_confirm_chunks,
                        "Speech start confirmed"
                    );
                    Some(SegmentEvent::SpeechStart)
                } else {
                    None
                }
            },
            (Phase::AwaitingSpeech, SpeechClass::NonSpeech) => {
                self.consecutive_speech = 0;
                None
            },
            (Phase::InSpeech, SpeechClass::Speech) => {
                self.consecutive_silence = 0;
                self.speech_chunks += 1;
                None
            },
            (Phase::InSpeech, SpeechClass::NonSpeech) => {
                self.consecutive_silence += 1;
                if self.consecutive_silence >= self.silence_confirm_chunks {
                    let speech =
                        Duration::from_millis((self.speech_chunks * self.chunk_ms) as u64);
                    self.reset();
                    tracing::debug!(
                        speech_ms = speech.as_millis() as u64,
                        "Speech end confirmed"
                    );
                    Some(SegmentEvent::SpeechEnd { speech })
                } else {
                    None
                }
            },
        };

        Ok(event)
    }

    /// True when a finished utterance is long enough to commit;
    /// shorter utterances are rejected as noise
    pub fn is_valid_utterance(&self, speech: Duration) -> bool {
        speech >= self.min_utterance
    }
}

/// Energy-threshold fallback classifier.
///
/// Used when the primary voice-activity detector is degraded: any
/// chunk whose RMS energy clears the floor counts as speech. Crude,
/// but keeps the pipeline conversational instead of aborting.
pub struct EnergySpeechClassifier {
    floor_db: f32,
}

impl EnergySpeechClassifier {
    pub fn new(floor_db: f32) -> Self {
        Self { floor_db }
    }
}

impl SpeechClassifier for EnergySpeechClassifier {
    fn classify(&self, chunk: &AudioChunk) -> Result<SpeechClass> {
        if chunk.energy_db >= self.floor_db {
            Ok(SpeechClass::Speech)
        } else {
            Ok(SpeechClass::NonSpeech)
        }
    }
}
