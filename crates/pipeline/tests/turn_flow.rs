//! End-to-end turn scenarios against mock collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use companion_config::{PersonaDescriptor, PersonaRegistry, Settings};
use companion_core::{
    AudioChunk, AudioIo, ChannelFactory, Component, Error, Modality, MotionSink,
    ReasoningBackend, Result, SampleRate, SpeechChannel, SpeechClass, SpeechClassifier,
    SynthesisFrame, Transcript, WakeWordDetector, WakeWordId,
};
use companion_pipeline::{
    Collaborators, PipelineObserver, PipelineState, VoicePipeline,
};

// ---- mocks ----------------------------------------------------------------

/// Capture/playback device producing one chunk per millisecond.
/// Sample level and read failures are switchable from the test body.
struct MockAudio {
    sequence: AtomicU64,
    level: AtomicI32,
    fail_reads: AtomicU32,
    played: Mutex<Vec<AudioChunk>>,
    closed: AtomicBool,
}

impl MockAudio {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sequence: AtomicU64::new(0),
            level: AtomicI32::new(0),
            fail_reads: AtomicU32::new(0),
            played: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AudioIo for MockAudio {
    async fn read_chunk(&self) -> Result<AudioChunk> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if self.fail_reads.load(Ordering::SeqCst) > 0 {
            self.fail_reads.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Device("mock capture failure".to_string()));
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let level = self.level.load(Ordering::SeqCst) as i16;
        Ok(AudioChunk::new(vec![level; 320], SampleRate::Hz16000, seq))
    }

    async fn play_chunk(&self, chunk: &AudioChunk) -> Result<()> {
        self.played.lock().push(chunk.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn chunk_duration(&self) -> Duration {
        Duration::from_millis(20)
    }
}

/// Pops one scripted detection per chunk; `None` once the script runs
/// out. A standing detection, set at construction or armed mid-test,
/// fires on every chunk instead.
struct MockWake {
    script: Mutex<VecDeque<Option<WakeWordId>>>,
    standing: Mutex<Option<WakeWordId>>,
}

impl MockWake {
    fn scripted(script: Vec<Option<WakeWordId>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            standing: Mutex::new(None),
        })
    }

    fn always(wake_id: &str) -> Arc<Self> {
        let wake = Self::scripted(vec![]);
        wake.arm(wake_id);
        wake
    }

    fn arm(&self, wake_id: &str) {
        *self.standing.lock() = Some(wake_id.to_string());
    }
}

impl WakeWordDetector for MockWake {
    fn process_chunk(&self, _chunk: &AudioChunk) -> Result<Option<WakeWordId>> {
        if let Some(id) = self.standing.lock().clone() {
            return Ok(Some(id));
        }
        Ok(self.script.lock().pop_front().flatten())
    }
}

/// Pops one scripted class per chunk; `NonSpeech` once the script runs out
struct MockClassifier {
    script: Mutex<VecDeque<SpeechClass>>,
    fail: AtomicBool,
}

impl MockClassifier {
    fn scripted(script: Vec<SpeechClass>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fail: AtomicBool::new(false),
        })
    }

    fn failing() -> Arc<Self> {
        let classifier = Self::scripted(vec![]);
        classifier.fail.store(true, Ordering::SeqCst);
        classifier
    }
}

impl SpeechClassifier for MockClassifier {
    fn classify(&self, _chunk: &AudioChunk) -> Result<SpeechClass> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Detection {
                component: Component::VoiceActivity,
                message: "mock classifier failure".to_string(),
            });
        }
        Ok(self.script.lock().pop_front().unwrap_or(SpeechClass::NonSpeech))
    }
}

/// Shared log of everything the channel side observed, in order
#[derive(Default)]
struct ChannelLog {
    events: Mutex<Vec<String>>,
    commits: Mutex<Vec<Vec<u64>>>,
    fail_opens: AtomicU32,
}

impl ChannelLog {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn opened_voices(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("open:").map(str::to_string))
            .collect()
    }
}

struct MockChannel {
    voice: String,
    log: Arc<ChannelLog>,
    sent: Vec<u64>,
    frames: u32,
}

#[async_trait]
impl SpeechChannel for MockChannel {
    async fn send_audio(&mut self, chunk: &AudioChunk) -> Result<()> {
        self.sent.push(chunk.sequence);
        Ok(())
    }

    async fn commit(&mut self) -> Result<Transcript> {
        self.log.commits.lock().push(std::mem::take(&mut self.sent));
        self.log.push("commit");
        Ok(Transcript {
            text: "turn on the lights".to_string(),
            confidence: 0.92,
        })
    }

    async fn synthesize(&mut self, _text: &str) -> Result<mpsc::Receiver<SynthesisFrame>> {
        self.log.push("synthesize");
        let (tx, rx) = mpsc::channel(8);
        let count = self.frames;
        tokio::spawn(async move {
            for i in 0..count {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let frame = SynthesisFrame {
                    chunk: AudioChunk::silence(20, SampleRate::Hz16000, i as u64),
                    amplitude: 0.5,
                    is_final: i + 1 == count,
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn close(&mut self) -> Result<()> {
        self.log.push(format!("close:{}", self.voice));
        Ok(())
    }

    fn voice_id(&self) -> &str {
        &self.voice
    }
}

struct MockFactory {
    log: Arc<ChannelLog>,
}

#[async_trait]
impl ChannelFactory for MockFactory {
    async fn open(&self, voice_id: &str) -> Result<Box<dyn SpeechChannel>> {
        if self.log.fail_opens.load(Ordering::SeqCst) > 0 {
            self.log.fail_opens.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Channel("mock open failure".to_string()));
        }
        self.log.push(format!("open:{voice_id}"));
        Ok(Box::new(MockChannel {
            voice: voice_id.to_string(),
            log: Arc::clone(&self.log),
            sent: Vec::new(),
            frames: 10,
        }))
    }
}

struct MockReasoning {
    response: String,
    delay: Duration,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl MockReasoning {
    fn new(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn slow(response: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            delay,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReasoningBackend for MockReasoning {
    async fn process(&self, _transcript: &str, _modality: Modality) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.response.clone())
    }

    async fn set_prompt(&self, prompt: &str) -> Result<()> {
        self.prompts.lock().push(prompt.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MockMotion {
    pauses: AtomicU32,
    resumes: AtomicU32,
    amplitudes: Mutex<Vec<f32>>,
}

impl MotionSink for MockMotion {
    fn on_amplitude(&self, amplitude: f32) {
        self.amplitudes.lock().push(amplitude);
    }

    fn pause_idle_behavior(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_idle_behavior(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<(PipelineState, PipelineState)>>,
    transcripts: Mutex<Vec<String>>,
    responses: Mutex<Vec<String>>,
    degraded: Mutex<Vec<(Component, bool)>>,
    errors: AtomicU32,
}

impl Recorder {
    fn saw_transition(&self, from: PipelineState, to: PipelineState) -> bool {
        self.transitions.lock().contains(&(from, to))
    }
}

impl PipelineObserver for Recorder {
    fn on_state_change(&self, from: PipelineState, to: PipelineState) {
        self.transitions.lock().push((from, to));
    }

    fn on_transcript(&self, text: &str) {
        self.transcripts.lock().push(text.to_string());
    }

    fn on_response(&self, text: &str) {
        self.responses.lock().push(text.to_string());
    }

    fn on_degraded_mode_change(&self, component: Component, degraded: bool) {
        self.degraded.lock().push((component, degraded));
    }

    fn on_error(&self, _error: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- harness --------------------------------------------------------------

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.audio.chunk_ms = 20;
    settings.audio.lead_in_silence_ms = 20;
    settings.segmenter.speech_confirm_ms = 60;
    settings.segmenter.silence_confirm_ms = 100;
    settings.segmenter.min_utterance_ms = 200;
    settings.timeouts.wake_detected_ms = 500;
    settings.timeouts.listening_speech_ms = 10_000;
    settings.timeouts.processing_ms = 2_000;
    settings.timeouts.speaking_ms = 2_000;
    settings.recovery.max_retries = 3;
    settings.recovery.initial_delay_ms = 1;
    settings.recovery.backoff_factor = 2.0;
    settings.recovery.max_delay_ms = 10;
    settings
}

fn test_registry() -> (tempfile::TempDir, PersonaRegistry) {
    let dir = tempfile::TempDir::new().unwrap();
    for (name, text) in [("luna.md", "You are Luna."), ("rex.md", "You are Rex.")] {
        std::fs::write(dir.path().join(name), text).unwrap();
    }
    let personas = vec![
        PersonaDescriptor {
            name: "luna".to_string(),
            wake_word_model_id: "hey_luna".to_string(),
            voice_id: "coral".to_string(),
            display_name: "Luna".to_string(),
            prompt_path: PathBuf::from("luna.md"),
            traits: vec!["cheerful".to_string()],
        },
        PersonaDescriptor {
            name: "rex".to_string(),
            wake_word_model_id: "hey_rex".to_string(),
            voice_id: "ash".to_string(),
            display_name: "Rex".to_string(),
            prompt_path: PathBuf::from("rex.md"),
            traits: vec![],
        },
    ];
    let registry = PersonaRegistry::from_descriptors(personas, dir.path()).unwrap();
    (dir, registry)
}

struct Harness {
    audio: Arc<MockAudio>,
    reasoning: Arc<MockReasoning>,
    motion: Arc<MockMotion>,
    observer: Arc<Recorder>,
    log: Arc<ChannelLog>,
    _prompt_dir: tempfile::TempDir,
}

fn harness(
    settings: Settings,
    wake: Arc<MockWake>,
    classifier: Arc<MockClassifier>,
    reasoning: Arc<MockReasoning>,
) -> (Harness, VoicePipeline) {
    let (_prompt_dir, registry) = test_registry();
    let audio = MockAudio::new();
    let motion = Arc::new(MockMotion::default());
    let observer = Arc::new(Recorder::default());
    let log = Arc::new(ChannelLog::default());

    let pipeline = VoicePipeline::new(
        settings,
        registry,
        Collaborators {
            audio: audio.clone(),
            wake,
            classifier,
            channel_factory: Arc::new(MockFactory {
                log: Arc::clone(&log),
            }),
            reasoning: reasoning.clone(),
            motion: motion.clone(),
            observer: observer.clone(),
        },
    )
    .unwrap();

    let harness = Harness {
        audio,
        reasoning,
        motion,
        observer,
        log,
        _prompt_dir,
    };
    (harness, pipeline)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 10s");
}

/// N consecutive speech classifications followed by endless silence
fn speech_script(speech_chunks: usize) -> Vec<SpeechClass> {
    vec![SpeechClass::Speech; speech_chunks]
}

// ---- tests ----------------------------------------------------------------

#[tokio::test]
async fn test_full_turn_round_trip() {
    let wake = MockWake::scripted(vec![None, None, Some("hey_luna".to_string())]);
    let classifier = MockClassifier::scripted(speech_script(12));
    let reasoning = MockReasoning::new("Lights are on.");
    let (h, mut pipeline) = harness(test_settings(), wake, classifier, reasoning);

    let handle = pipeline.handle();
    let observer = h.observer.clone();
    let task = tokio::spawn(async move {
        let result = pipeline.run().await;
        (pipeline, result)
    });

    wait_for(|| observer.saw_transition(PipelineState::Speaking, PipelineState::ListeningWake))
        .await;
    handle.shutdown().await;
    let (pipeline, result) = task.await.unwrap();
    assert!(result.is_ok());

    // The canonical turn sequence, in order
    let expected = [
        (PipelineState::Idle, PipelineState::ListeningWake),
        (PipelineState::ListeningWake, PipelineState::WakeDetected),
        (PipelineState::WakeDetected, PipelineState::ListeningSpeech),
        (PipelineState::ListeningSpeech, PipelineState::Processing),
        (PipelineState::Processing, PipelineState::Speaking),
        (PipelineState::Speaking, PipelineState::ListeningWake),
    ];
    let transitions = h.observer.transitions.lock().clone();
    assert_eq!(&transitions[..6], &expected);

    // The commit carries the speech span: every chunk contiguous, and
    // the trailing confirmed-silence window trimmed
    let commits = h.log.commits.lock().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].len(), 12);
    for pair in commits[0].windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }

    assert_eq!(h.observer.transcripts.lock().as_slice(), ["turn on the lights"]);
    assert_eq!(h.observer.responses.lock().as_slice(), ["Lights are on."]);

    // Same persona woke the pipeline: no switch was ever queued
    assert_eq!(pipeline.pending_persona(), None);
    assert_eq!(pipeline.active_persona().name, "luna");
    assert!(pipeline.recovery().is_clean());
    assert_eq!(h.log.opened_voices(), ["coral"]);

    // Motion paused exactly once and saw every synthesized frame
    assert_eq!(h.motion.pauses.load(Ordering::SeqCst), 1);
    assert_eq!(h.motion.resumes.load(Ordering::SeqCst), 1);
    assert_eq!(h.motion.amplitudes.lock().len(), 10);

    // Lead-in silence plus ten synthesized chunks reached the device
    assert_eq!(h.audio.played.lock().len(), 11);
    assert!(h.audio.closed.load(Ordering::SeqCst));

    // Every armed watchdog was canceled by a normal transition
    let (started, canceled) = pipeline.watchdog_counts();
    assert!(started >= 4, "expected at least four watchdogs, got {started}");
    assert_eq!(started, canceled);
    assert_eq!(h.observer.errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_short_utterance_never_reaches_processing() {
    // 4 speech chunks (80ms) is under the 200ms minimum
    let wake = MockWake::scripted(vec![Some("hey_luna".to_string())]);
    let classifier = MockClassifier::scripted(speech_script(4));
    let reasoning = MockReasoning::new("unused");
    let (h, mut pipeline) = harness(test_settings(), wake, classifier, reasoning);

    let handle = pipeline.handle();
    let observer = h.observer.clone();
    let task = tokio::spawn(async move {
        let result = pipeline.run().await;
        (pipeline, result)
    });

    wait_for(|| {
        observer.saw_transition(PipelineState::ListeningSpeech, PipelineState::ListeningWake)
    })
    .await;
    handle.shutdown().await;
    let (pipeline, result) = task.await.unwrap();
    assert!(result.is_ok());

    assert!(!h.observer.saw_transition(PipelineState::ListeningSpeech, PipelineState::Processing));
    assert_eq!(h.reasoning.calls.load(Ordering::SeqCst), 0);
    assert!(h.log.commits.lock().is_empty());
    assert!(pipeline.recovery().is_clean());
}

#[tokio::test]
async fn test_wake_during_playback_switches_persona_after_playback() {
    // Luna wakes the pipeline; Rex's wake word arrives while the
    // response is still playing
    let wake = MockWake::scripted(vec![
        Some("hey_luna".to_string()),
        Some("hey_rex".to_string()),
    ]);
    let classifier = MockClassifier::scripted(speech_script(12));
    let reasoning = MockReasoning::new("Certainly.");
    let (h, mut pipeline) = harness(test_settings(), wake, classifier, reasoning);

    let handle = pipeline.handle();
    let observer = h.observer.clone();
    let task = tokio::spawn(async move {
        let result = pipeline.run().await;
        (pipeline, result)
    });

    wait_for(|| observer.saw_transition(PipelineState::Speaking, PipelineState::ListeningWake))
        .await;
    handle.shutdown().await;
    let (pipeline, result) = task.await.unwrap();
    assert!(result.is_ok());

    // Playback ran on the old voice; the new channel opened only after
    // synthesis completed
    assert_eq!(h.log.opened_voices(), ["coral", "ash"]);
    let events = h.log.events();
    let synth_at = events.iter().position(|e| e == "synthesize").unwrap();
    let reopen_at = events.iter().position(|e| e == "open:ash").unwrap();
    assert!(reopen_at > synth_at);
    assert!(events.contains(&"close:coral".to_string()));

    assert_eq!(pipeline.active_persona().name, "rex");
    assert_eq!(pipeline.pending_persona(), None);

    // The new prompt reached the reasoning backend
    let prompts = h.reasoning.prompts.lock().clone();
    assert_eq!(prompts.last().map(String::as_str), Some("You are Rex."));
}

#[tokio::test]
async fn test_processing_timeout_records_backend_failure() {
    let mut settings = test_settings();
    settings.timeouts.processing_ms = 100;

    let wake = MockWake::scripted(vec![Some("hey_luna".to_string())]);
    let classifier = MockClassifier::scripted(speech_script(12));
    let reasoning = MockReasoning::slow("too late", Duration::from_secs(30));
    let (h, mut pipeline) = harness(settings, wake, classifier, reasoning);

    let handle = pipeline.handle();
    let observer = h.observer.clone();
    let task = tokio::spawn(async move {
        let result = pipeline.run().await;
        (pipeline, result)
    });

    wait_for(|| observer.saw_transition(PipelineState::Error, PipelineState::ListeningWake))
        .await;
    handle.shutdown().await;
    let (pipeline, result) = task.await.unwrap();
    assert!(result.is_ok(), "one timeout is below the retry budget");

    assert!(h.observer.saw_transition(PipelineState::Processing, PipelineState::Error));
    assert_eq!(
        pipeline.recovery().consecutive_failures(Component::ReasoningBackend),
        1
    );
    assert!(!pipeline.recovery().is_degraded(Component::ReasoningBackend));
    assert_eq!(h.observer.errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_device_errors_degrade_audio_device() {
    // max_retries = 3, so the fourth consecutive failure degrades
    let wake = MockWake::scripted(vec![]);
    let classifier = MockClassifier::scripted(vec![]);
    let reasoning = MockReasoning::new("unused");
    let (h, mut pipeline) = harness(test_settings(), wake, classifier, reasoning);
    h.audio.fail_reads.store(4, Ordering::SeqCst);

    let handle = pipeline.handle();
    let observer = h.observer.clone();
    let task = tokio::spawn(async move {
        let result = pipeline.run().await;
        (pipeline, result)
    });

    wait_for(|| {
        observer
            .degraded
            .lock()
            .contains(&(Component::AudioDevice, true))
    })
    .await;

    // Reads recovered; the pipeline keeps listening instead of aborting
    wait_for(|| handle.state() == PipelineState::ListeningWake).await;
    handle.shutdown().await;
    let (pipeline, result) = task.await.unwrap();
    assert!(result.is_ok());
    assert!(pipeline.recovery().is_degraded(Component::AudioDevice));
    assert_eq!(h.observer.errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_classifier_failure_falls_back_to_energy_threshold() {
    let mut settings = test_settings();
    settings.recovery.max_retries = 1;

    let wake = MockWake::always("hey_luna");
    let classifier = MockClassifier::failing();
    let reasoning = MockReasoning::new("Heard you.");
    let (h, mut pipeline) = harness(settings, wake, classifier, reasoning);

    let handle = pipeline.handle();
    let observer = h.observer.clone();
    let task = tokio::spawn(async move {
        let result = pipeline.run().await;
        (pipeline, result)
    });

    wait_for(|| {
        observer
            .degraded
            .lock()
            .contains(&(Component::VoiceActivity, true))
    })
    .await;

    // Speak through the energy fallback: loud chunks, then silence
    wait_for(|| handle.state() == PipelineState::ListeningSpeech).await;
    h.audio.level.store(12_000, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.audio.level.store(0, Ordering::SeqCst);

    wait_for(|| observer.saw_transition(PipelineState::Speaking, PipelineState::ListeningWake))
        .await;
    handle.shutdown().await;
    let (pipeline, result) = task.await.unwrap();
    assert!(result.is_ok());
    assert!(pipeline.recovery().is_degraded(Component::VoiceActivity));
    assert_eq!(h.reasoning.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.commits.lock().len(), 1);
}

#[tokio::test]
async fn test_failed_channel_reopen_leaves_switch_pending() {
    // Rex is queued during the turn; the reopen after playback fails
    // once, so the switch applies on the next successful open
    let wake = MockWake::scripted(vec![
        Some("hey_luna".to_string()),
        Some("hey_rex".to_string()),
    ]);
    let wake_again = wake.clone();
    let classifier = MockClassifier::scripted(speech_script(12));
    let reasoning = MockReasoning::new("One moment.");
    let (h, mut pipeline) = harness(test_settings(), wake, classifier, reasoning);

    let handle = pipeline.handle();
    let observer = h.observer.clone();
    let log = h.log.clone();

    // Queue exactly one open failure for the post-playback reopen
    let task = tokio::spawn(async move {
        let result = pipeline.run().await;
        (pipeline, result)
    });
    wait_for(|| log.events().contains(&"synthesize".to_string())).await;
    log.fail_opens.store(1, Ordering::SeqCst);

    // Wake again once the old channel has closed: this wake lands
    // after the failed reopen and starts the turn whose channel open
    // completes the switch
    wait_for(|| log.events().contains(&"close:coral".to_string())).await;
    wake_again.arm("hey_rex");
    wait_for(|| log.opened_voices() == ["coral", "ash"]).await;
    wait_for(|| observer.saw_transition(PipelineState::WakeDetected, PipelineState::ListeningSpeech)).await;
    handle.shutdown().await;
    let (pipeline, result) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(pipeline.active_persona().name, "rex");
    assert_eq!(pipeline.pending_persona(), None);
}
