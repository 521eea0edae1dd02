//! Stand-in collaborators for running the pipeline on real hardware
//! without any external services.
//!
//! The loopback channel parrots the committed utterance back through
//! the synthesis path, which exercises capture, segmentation, commit,
//! playback, and motion timing end to end with nothing but a
//! microphone and a speaker attached.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use companion_core::{
    AudioChunk, AudioIo, ChannelFactory, Modality, MotionSink, ReasoningBackend, Result,
    SpeechChannel, SynthesisFrame, Transcript, WakeWordDetector, WakeWordId,
};

/// Blocks retriggering while the pipeline plays its own echo back
const WAKE_REFRACTORY: Duration = Duration::from_secs(2);

/// Energy-level wake trigger.
///
/// Fires the configured model id after a run of consecutive chunks
/// above the floor. No phrase recognition: any sustained sound wakes
/// the pipeline, which is exactly what a hardware bring-up needs.
pub struct LevelTriggerWake {
    model_id: String,
    floor_db: f32,
    confirm_chunks: u32,
    inner: Mutex<WakeState>,
}

struct WakeState {
    streak: u32,
    last_fire: Option<Instant>,
}

impl LevelTriggerWake {
    pub fn new(model_id: impl Into<String>, floor_db: f32, confirm_chunks: u32) -> Self {
        Self {
            model_id: model_id.into(),
            floor_db,
            confirm_chunks: confirm_chunks.max(1),
            inner: Mutex::new(WakeState {
                streak: 0,
                last_fire: None,
            }),
        }
    }
}

impl WakeWordDetector for LevelTriggerWake {
    fn process_chunk(&self, chunk: &AudioChunk) -> Result<Option<WakeWordId>> {
        let mut inner = self.inner.lock();

        if let Some(fired) = inner.last_fire {
            if fired.elapsed() < WAKE_REFRACTORY {
                inner.streak = 0;
                return Ok(None);
            }
        }

        if chunk.energy_db >= self.floor_db {
            inner.streak += 1;
        } else {
            inner.streak = 0;
        }

        if inner.streak >= self.confirm_chunks {
            inner.streak = 0;
            inner.last_fire = Some(Instant::now());
            return Ok(Some(self.model_id.clone()));
        }
        Ok(None)
    }
}

/// Channel that echoes the committed utterance as its synthesis
pub struct LoopbackChannel {
    voice_id: String,
    pending: Vec<AudioChunk>,
    committed: Vec<AudioChunk>,
}

#[async_trait]
impl SpeechChannel for LoopbackChannel {
    async fn send_audio(&mut self, chunk: &AudioChunk) -> Result<()> {
        self.pending.push(chunk.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<Transcript> {
        self.committed = std::mem::take(&mut self.pending);
        let speech_ms: u64 = self.committed.iter().map(|c| c.duration_ms()).sum();
        Ok(Transcript {
            text: format!("{}ms of speech", speech_ms),
            confidence: 1.0,
        })
    }

    /// Replays the committed audio as synthesis frames, paced at real
    /// time so the playback queue never overflows
    async fn synthesize(&mut self, _text: &str) -> Result<mpsc::Receiver<SynthesisFrame>> {
        let chunks = std::mem::take(&mut self.committed);
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let total = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                let pace = Duration::from_millis(chunk.duration_ms());
                let frame = SynthesisFrame {
                    amplitude: chunk.amplitude(),
                    is_final: i + 1 == total,
                    chunk,
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
                tokio::time::sleep(pace).await;
            }
        });

        Ok(rx)
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.committed.clear();
        Ok(())
    }

    fn voice_id(&self) -> &str {
        &self.voice_id
    }
}

#[derive(Default)]
pub struct LoopbackChannelFactory;

#[async_trait]
impl ChannelFactory for LoopbackChannelFactory {
    async fn open(&self, voice_id: &str) -> Result<Box<dyn SpeechChannel>> {
        tracing::debug!(voice = voice_id, "opening loopback channel");
        Ok(Box::new(LoopbackChannel {
            voice_id: voice_id.to_string(),
            pending: Vec::new(),
            committed: Vec::new(),
        }))
    }
}

/// Returns the transcript unchanged; the loopback channel ignores the
/// response text anyway, so the prompt is only acknowledged in the log
#[derive(Default)]
pub struct EchoReasoning;

#[async_trait]
impl ReasoningBackend for EchoReasoning {
    async fn process(&self, transcript: &str, _modality: Modality) -> Result<String> {
        Ok(transcript.to_string())
    }

    async fn set_prompt(&self, prompt: &str) -> Result<()> {
        tracing::debug!(len = prompt.len(), "system prompt updated");
        Ok(())
    }
}

/// Logs motion commands instead of driving servos
pub struct LogMotionSink;

impl MotionSink for LogMotionSink {
    fn on_amplitude(&self, amplitude: f32) {
        tracing::trace!(amplitude, "mouth amplitude");
    }

    fn pause_idle_behavior(&self) {
        tracing::debug!("idle motion paused");
    }

    fn resume_idle_behavior(&self) {
        tracing::debug!("idle motion resumed");
    }
}

/// One chunk period as reported by the device, used to derive the wake
/// trigger's confirmation window from a millisecond setting
pub fn confirm_chunks(confirm_ms: u32, audio: &dyn AudioIo) -> u32 {
    let chunk_ms = audio.chunk_duration().as_millis().max(1) as u32;
    (confirm_ms / chunk_ms).max(1)
}
