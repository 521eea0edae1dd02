//! The pipeline orchestrator
//!
//! Owns `PipelineState` and is its sole writer: every mutation goes
//! through [`VoicePipeline::transition`], which validates the edge,
//! swaps the timeout watchdog, and notifies the observer. Stage calls
//! inside a turn are sequential on the orchestrator's task; each
//! long-running await is bounded by the entering state's dwell limit
//! so nothing can hold the pipeline indefinitely.
//!
//! Watchdogs are spawned per state entry and aborted on exit. A
//! watchdog that fires sends a control message carrying the epoch it
//! was scheduled in; messages from an abandoned epoch are ignored, so
//! a stale timer can never fault a later state.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use companion_config::{PersonaDescriptor, PersonaRegistry, Settings};
use companion_core::{
    AudioChunk, AudioIo, ChannelFactory, Component, Error, Modality, MotionSink,
    ReasoningBackend, Result, SampleRate, SpeechChannel, SpeechClassifier, UtteranceBuffer,
    WakeWordDetector,
};

use crate::observer::PipelineObserver;
use crate::recovery::{RecoveryAction, RecoveryManager};
use crate::segmenter::{EnergySpeechClassifier, SegmentEvent, Segmenter};
use crate::state::{is_valid_transition, PipelineState, StateTimeoutPolicy};

/// External collaborators injected at construction
pub struct Collaborators {
    pub audio: Arc<dyn AudioIo>,
    pub wake: Arc<dyn WakeWordDetector>,
    pub classifier: Arc<dyn SpeechClassifier>,
    pub channel_factory: Arc<dyn ChannelFactory>,
    pub reasoning: Arc<dyn ReasoningBackend>,
    pub motion: Arc<dyn MotionSink>,
    pub observer: Arc<dyn PipelineObserver>,
}

/// Control messages injected into the orchestrator loop
#[derive(Debug, Clone)]
enum CtrlMsg {
    /// A state watchdog fired
    StateTimeout { state: PipelineState, epoch: u64 },
    /// Operator cleared a degraded flag
    ResetDegraded(Component),
    Shutdown,
}

/// What the capture loop produced this iteration
enum Step {
    Chunk(AudioChunk),
    Ctrl(CtrlMsg),
}

/// Loop continuation decision for one step
enum Flow {
    Continue,
    Shutdown,
}

/// Cloneable handle for controlling a running pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    ctrl_tx: mpsc::Sender<CtrlMsg>,
    state: Arc<Mutex<PipelineState>>,
}

impl PipelineHandle {
    /// Snapshot of the current state
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Request a clean shutdown; the run loop closes devices and
    /// returns once the current playback (if any) finishes
    pub async fn shutdown(&self) {
        let _ = self.ctrl_tx.send(CtrlMsg::Shutdown).await;
    }

    /// Clear a component's degraded flag (operator action)
    pub async fn reset_degraded(&self, component: Component) {
        let _ = self.ctrl_tx.send(CtrlMsg::ResetDegraded(component)).await;
    }
}

/// The voice pipeline state machine
pub struct VoicePipeline {
    // Collaborators
    audio: Arc<dyn AudioIo>,
    wake: Arc<dyn WakeWordDetector>,
    primary_classifier: Arc<dyn SpeechClassifier>,
    channel_factory: Arc<dyn ChannelFactory>,
    reasoning: Arc<dyn ReasoningBackend>,
    motion: Arc<dyn MotionSink>,
    observer: Arc<dyn PipelineObserver>,

    // Configuration
    settings: Settings,
    personas: PersonaRegistry,
    policy: StateTimeoutPolicy,
    sample_rate: SampleRate,

    // State machine
    state: PipelineState,
    state_entered: Instant,
    shared_state: Arc<Mutex<PipelineState>>,
    epoch: u64,
    watchdog: Option<JoinHandle<()>>,
    watchdogs_started: u64,
    watchdogs_canceled: u64,
    ctrl_tx: mpsc::Sender<CtrlMsg>,
    ctrl_rx: mpsc::Receiver<CtrlMsg>,

    // Turn state
    segmenter: Segmenter,
    recovery: RecoveryManager,
    channel: Option<Box<dyn SpeechChannel>>,
    active_persona: PersonaDescriptor,
    pending_switch: Option<PersonaDescriptor>,
    utterance: UtteranceBuffer,
    speech_start_idx: Option<usize>,
    speech_end_idx: Option<usize>,
    response_text: Option<String>,
}

impl VoicePipeline {
    /// Construct the pipeline. Configuration violations (unknown
    /// default persona, invalid thresholds) fail here, never at
    /// runtime.
    pub fn new(
        settings: Settings,
        personas: PersonaRegistry,
        collaborators: Collaborators,
    ) -> Result<Self> {
        settings.validate().map_err(Error::from)?;

        let active_persona = personas
            .get_by_name(&settings.personas.default_persona)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "default persona '{}' not in the persona table",
                    settings.personas.default_persona
                ))
            })?;

        // Guaranteed by validate(), re-checked to avoid a panic path
        let sample_rate = SampleRate::from_u32(settings.audio.sample_rate)
            .ok_or_else(|| Error::Config("unsupported sample rate".to_string()))?;

        let policy = StateTimeoutPolicy::from_settings(&settings.timeouts);
        let segmenter = Segmenter::new(
            Arc::clone(&collaborators.classifier),
            &settings.segmenter,
            settings.audio.chunk_ms,
        );
        let recovery = RecoveryManager::new(settings.recovery.clone());
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);

        Ok(Self {
            audio: collaborators.audio,
            wake: collaborators.wake,
            primary_classifier: collaborators.classifier,
            channel_factory: collaborators.channel_factory,
            reasoning: collaborators.reasoning,
            motion: collaborators.motion,
            observer: collaborators.observer,
            settings,
            personas,
            policy,
            sample_rate,
            state: PipelineState::Idle,
            state_entered: Instant::now(),
            shared_state: Arc::new(Mutex::new(PipelineState::Idle)),
            epoch: 0,
            watchdog: None,
            watchdogs_started: 0,
            watchdogs_canceled: 0,
            ctrl_tx,
            ctrl_rx,
            segmenter,
            recovery,
            channel: None,
            active_persona,
            pending_switch: None,
            utterance: UtteranceBuffer::new(),
            speech_start_idx: None,
            speech_end_idx: None,
            response_text: None,
        })
    }

    /// Control handle; valid before and during `run`
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            ctrl_tx: self.ctrl_tx.clone(),
            state: Arc::clone(&self.shared_state),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn active_persona(&self) -> &PersonaDescriptor {
        &self.active_persona
    }

    pub fn pending_persona(&self) -> Option<&str> {
        self.pending_switch.as_ref().map(|p| p.name.as_str())
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// (started, canceled) watchdog counts since construction
    pub fn watchdog_counts(&self) -> (u64, u64) {
        (self.watchdogs_started, self.watchdogs_canceled)
    }

    /// Drive the pipeline until shutdown or an unrecoverable failure.
    /// On abort all devices are closed before the error is returned.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            persona = %self.active_persona.name,
            voice = %self.active_persona.voice_id,
            "Voice pipeline starting"
        );
        self.transition(PipelineState::ListeningWake)?;

        loop {
            let step = match self.state {
                PipelineState::Idle => return Ok(()),
                PipelineState::ListeningWake => self.step_listening_wake().await,
                PipelineState::WakeDetected => self.step_wake_detected().await,
                PipelineState::ListeningSpeech => self.step_listening_speech().await,
                PipelineState::Processing => self.step_processing().await,
                PipelineState::Speaking => self.step_speaking().await,
                // Failure handling always leaves Error before the loop
                // comes back around
                PipelineState::Error => {
                    self.transition(PipelineState::ListeningWake).map(|_| Flow::Continue)
                },
            };

            match step {
                Ok(Flow::Continue) => {},
                Ok(Flow::Shutdown) => {
                    self.stop_to_idle().await;
                    return Ok(());
                },
                Err(error) => self.handle_failure(error).await?,
            }
        }
    }

    /// The single state mutation point. Validates the edge, cancels
    /// the previous watchdog in O(1), and arms the next one.
    fn transition(&mut self, to: PipelineState) -> Result<()> {
        let from = self.state;
        if !is_valid_transition(from, to) {
            return Err(Error::InvalidTransition {
                from: from.name(),
                to: to.name(),
            });
        }

        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
            self.watchdogs_canceled += 1;
        }
        self.epoch += 1;

        let dwell = self.state_entered.elapsed();
        tracing::info!(%from, %to, dwell_ms = dwell.as_millis() as u64, "State transition");
        self.observer.on_state_change(from, to);

        self.state = to;
        *self.shared_state.lock() = to;
        self.state_entered = Instant::now();

        if let Some(limit) = self.policy.timeout_for(to) {
            let tx = self.ctrl_tx.clone();
            let epoch = self.epoch;
            self.watchdog = Some(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let _ = tx.send(CtrlMsg::StateTimeout { state: to, epoch }).await;
            }));
            self.watchdogs_started += 1;
        }

        Ok(())
    }

    /// Wait for the next chunk or control message. Control messages
    /// win ties so a timeout is never starved by a busy capture stream.
    async fn next_step(&mut self) -> Result<Step> {
        let audio = Arc::clone(&self.audio);
        tokio::select! {
            biased;
            msg = self.ctrl_rx.recv() => Ok(Step::Ctrl(msg.unwrap_or(CtrlMsg::Shutdown))),
            chunk = audio.read_chunk() => Ok(Step::Chunk(chunk?)),
        }
    }

    fn on_ctrl(&mut self, msg: CtrlMsg) -> Result<Flow> {
        match msg {
            CtrlMsg::Shutdown => Ok(Flow::Shutdown),
            CtrlMsg::ResetDegraded(component) => {
                self.recovery.reset_degraded(component);
                self.observer.on_degraded_mode_change(component, false);
                self.refresh_classifier();
                Ok(Flow::Continue)
            },
            CtrlMsg::StateTimeout { state, epoch } => {
                if epoch != self.epoch || state != self.state {
                    tracing::debug!(%state, epoch, "Stale watchdog ignored");
                    return Ok(Flow::Continue);
                }
                Err(self.state_timeout_error(state))
            },
        }
    }

    fn state_timeout_error(&self, state: PipelineState) -> Error {
        Error::Timeout {
            state: state.name(),
            elapsed: self.state_entered.elapsed(),
            component: StateTimeoutPolicy::timeout_component(state),
        }
    }

    // ---- per-state steps -------------------------------------------------

    async fn step_listening_wake(&mut self) -> Result<Flow> {
        if self.recovery.is_degraded(Component::WakeWord) {
            // Wake stage bypassed: go straight to capture
            tracing::debug!("Wake-word stage degraded, capturing directly");
            self.begin_capture()?;
            return Ok(Flow::Continue);
        }

        match self.next_step().await? {
            Step::Ctrl(msg) => self.on_ctrl(msg),
            Step::Chunk(chunk) => {
                self.recovery.record_success(Component::AudioDevice);
                match self.wake.process_chunk(&chunk)? {
                    Some(wake_id) => {
                        tracing::info!(wake_id = %wake_id, "Wake word detected");
                        self.recovery.record_success(Component::WakeWord);
                        self.transition(PipelineState::WakeDetected)?;
                        self.mark_persona(&wake_id);
                        Ok(Flow::Continue)
                    },
                    None => Ok(Flow::Continue),
                }
            },
        }
    }

    async fn step_wake_detected(&mut self) -> Result<Flow> {
        // Channel setup is the only work in this state; bound it by
        // the wake-detected dwell limit
        let setup = tokio::time::timeout(self.policy.wake_detected, self.ensure_channel()).await;
        match setup {
            Ok(Ok(())) => {
                self.begin_capture()?;
                Ok(Flow::Continue)
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.state_timeout_error(PipelineState::WakeDetected)),
        }
    }

    async fn step_listening_speech(&mut self) -> Result<Flow> {
        match self.next_step().await? {
            Step::Ctrl(msg) => self.on_ctrl(msg),
            Step::Chunk(chunk) => {
                self.recovery.record_success(Component::AudioDevice);
                let event = self.segmenter.process(&chunk)?;
                self.utterance.push(chunk);

                match event {
                    None => Ok(Flow::Continue),
                    Some(SegmentEvent::SpeechStart) => {
                        self.recovery.record_success(Component::VoiceActivity);
                        let confirm = self.segmenter.speech_confirm_chunks() as usize;
                        self.speech_start_idx =
                            Some(self.utterance.len().saturating_sub(confirm));
                        Ok(Flow::Continue)
                    },
                    Some(SegmentEvent::SpeechEnd { speech }) => {
                        self.recovery.record_success(Component::VoiceActivity);
                        let tail = self.segmenter.silence_confirm_chunks() as usize;
                        self.speech_end_idx = Some(self.utterance.len().saturating_sub(tail));

                        if !self.segmenter.is_valid_utterance(speech) {
                            tracing::info!(
                                speech_ms = speech.as_millis() as u64,
                                "Utterance below minimum duration, treating as noise"
                            );
                            self.discard_turn();
                            self.transition(PipelineState::ListeningWake)?;
                        } else {
                            self.transition(PipelineState::Processing)?;
                        }
                        Ok(Flow::Continue)
                    },
                }
            },
        }
    }

    async fn step_processing(&mut self) -> Result<Flow> {
        let buffer = std::mem::take(&mut self.utterance);
        let start = self.speech_start_idx.take().unwrap_or(0);
        let end = self.speech_end_idx.take().unwrap_or(buffer.len());

        // A gapped or empty buffer is an invalid commit; the turn is
        // dropped and the next one starts from a fresh buffer
        if buffer.is_empty() || end <= start {
            tracing::warn!("Empty utterance at commit, discarding");
            self.transition(PipelineState::ListeningWake)?;
            return Ok(Flow::Continue);
        }
        if !buffer.is_contiguous() {
            tracing::warn!(
                range = ?buffer.sequence_range(),
                "Utterance buffer has sequence gaps, discarding"
            );
            self.transition(PipelineState::ListeningWake)?;
            return Ok(Flow::Continue);
        }

        let deadline = tokio::time::Instant::now() + self.policy.processing;

        let commit = tokio::time::timeout_at(deadline, async {
            if self.channel.is_none() {
                self.ensure_channel().await?;
            }
            let channel = self
                .channel
                .as_mut()
                .ok_or_else(|| Error::Channel("speech channel not open".to_string()))?;
            for chunk in buffer.chunks().skip(start).take(end - start) {
                channel.send_audio(chunk).await?;
            }
            channel.commit().await
        })
        .await;

        let transcript = match commit {
            Ok(Ok(transcript)) => transcript,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Timeout {
                    state: PipelineState::Processing.name(),
                    elapsed: self.state_entered.elapsed(),
                    component: Component::TranscriptionChannel,
                })
            },
        };
        self.recovery.record_success(Component::TranscriptionChannel);
        tracing::info!(
            confidence = transcript.confidence,
            chars = transcript.text.len(),
            "Transcript received"
        );
        self.observer.on_transcript(&transcript.text);

        let response = match tokio::time::timeout_at(
            deadline,
            self.reasoning.process(&transcript.text, Modality::Voice),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(self.state_timeout_error(PipelineState::Processing)),
        };
        self.recovery.record_success(Component::ReasoningBackend);

        if response.trim().is_empty() {
            tracing::info!("Empty reasoning response, nothing to say");
            self.transition(PipelineState::ListeningWake)?;
            return Ok(Flow::Continue);
        }

        self.observer.on_response(&response);
        self.response_text = Some(response);
        self.transition(PipelineState::Speaking)?;
        Ok(Flow::Continue)
    }

    async fn step_speaking(&mut self) -> Result<Flow> {
        let text = match self.response_text.take() {
            Some(text) => text,
            None => {
                tracing::warn!("Entered speaking with no response text");
                self.transition(PipelineState::ListeningWake)?;
                return Ok(Flow::Continue);
            },
        };

        self.motion.pause_idle_behavior();
        let played = self.play_response(&text).await;
        self.motion.resume_idle_behavior();
        played?;

        // Safe point: playback is complete, so a queued persona switch
        // may now reopen the channel with the new voice
        self.apply_pending_switch().await?;
        self.transition(PipelineState::ListeningWake)?;
        Ok(Flow::Continue)
    }

    async fn play_response(&mut self, text: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.policy.speaking;

        // Short silence prefix wakes the hardware output path so the
        // first synthesized chunk does not click
        let lead_in = AudioChunk::silence(
            self.settings.audio.lead_in_silence_ms,
            self.sample_rate,
            0,
        );
        self.audio.play_chunk(&lead_in).await?;

        let synthesized = {
            let channel = self
                .channel
                .as_mut()
                .ok_or_else(|| Error::Channel("speech channel not open".to_string()))?;
            tokio::time::timeout_at(deadline, channel.synthesize(text)).await
        };
        let mut frames = match synthesized {
            Ok(frames) => frames?,
            Err(_) => return Err(self.state_timeout_error(PipelineState::Speaking)),
        };

        // Capture keeps flowing during playback so a wake word spoken
        // over the response can still queue a persona switch
        enum Playback {
            Frame(Option<companion_core::SynthesisFrame>),
            Chunk(Result<AudioChunk>),
            Timeout,
        }

        loop {
            let audio = Arc::clone(&self.audio);
            let event = tokio::select! {
                frame = frames.recv() => Playback::Frame(frame),
                chunk = audio.read_chunk() => Playback::Chunk(chunk),
                _ = tokio::time::sleep_until(deadline) => Playback::Timeout,
            };

            match event {
                Playback::Frame(Some(frame)) => {
                    self.audio.play_chunk(&frame.chunk).await?;
                    self.motion.on_amplitude(frame.amplitude);
                    if frame.is_final {
                        break;
                    }
                },
                Playback::Frame(None) => break,
                Playback::Chunk(Ok(chunk)) => {
                    if !self.recovery.is_degraded(Component::WakeWord) {
                        match self.wake.process_chunk(&chunk) {
                            Ok(Some(wake_id)) => {
                                tracing::info!(wake_id = %wake_id, "Wake word during playback");
                                self.mark_persona(&wake_id);
                            },
                            Ok(None) => {},
                            Err(e) => {
                                tracing::debug!(error = %e, "Wake detection during playback failed")
                            },
                        }
                    }
                },
                Playback::Chunk(Err(e)) => return Err(e),
                Playback::Timeout => {
                    return Err(self.state_timeout_error(PipelineState::Speaking))
                },
            }
        }

        self.recovery.record_success(Component::AudioDevice);
        Ok(())
    }

    // ---- persona switching ----------------------------------------------

    /// Mark phase of the two-phase switch: queue the persona bound to
    /// this wake word. Single slot, last detected wins. Waking the
    /// active persona clears any queued switch.
    fn mark_persona(&mut self, wake_id: &str) {
        let Some(persona) = self.personas.get(wake_id) else {
            tracing::debug!(wake_id, "No persona bound to wake word");
            return;
        };

        if persona.name == self.active_persona.name {
            if self.pending_switch.take().is_some() {
                tracing::info!("Queued persona switch cleared by active-persona wake");
            }
            return;
        }

        if let Some(previous) = &self.pending_switch {
            tracing::info!(
                replaced = %previous.name,
                queued = %persona.name,
                "Replacing queued persona switch"
            );
        } else {
            tracing::info!(queued = %persona.name, "Persona switch queued");
        }
        self.pending_switch = Some(persona.clone());
    }

    /// Apply phase: runs only after playback completes. On failure the
    /// switch stays queued and applies on the next channel open.
    async fn apply_pending_switch(&mut self) -> Result<()> {
        let Some(target) = self.pending_switch.clone() else {
            return Ok(());
        };

        tracing::info!(
            from = %self.active_persona.name,
            to = %target.name,
            "Applying persona switch"
        );
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                tracing::warn!(error = %e, "Channel close during persona switch failed");
            }
        }
        self.open_channel(&target).await
    }

    /// Open the channel for the active persona, or finish a switch
    /// that a failed reopen left queued
    async fn ensure_channel(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }
        let persona = self
            .pending_switch
            .clone()
            .unwrap_or_else(|| self.active_persona.clone());
        self.open_channel(&persona).await
    }

    async fn open_channel(&mut self, persona: &PersonaDescriptor) -> Result<()> {
        let channel = self.channel_factory.open(&persona.voice_id).await?;
        let prompt = self.personas.load_prompt(persona)?;
        self.reasoning.set_prompt(&prompt).await?;
        self.channel = Some(channel);
        self.recovery.record_success(Component::TranscriptionChannel);

        if self.pending_switch.as_ref() == Some(persona) {
            self.pending_switch = None;
        }
        self.active_persona = persona.clone();
        tracing::info!(
            persona = %persona.name,
            voice = %persona.voice_id,
            "Speech channel open"
        );
        Ok(())
    }

    // ---- failure handling ------------------------------------------------

    /// Route a stage failure through the recovery manager and act on
    /// its decision. Returns `Err` only when the pipeline aborts.
    async fn handle_failure(&mut self, error: Error) -> Result<()> {
        let Some(component) = error.component() else {
            // Config and transition-table violations are not
            // runtime-recoverable
            tracing::error!(error = %error, "Unrecoverable pipeline failure");
            self.observer.on_error(&error);
            self.stop_to_idle().await;
            return Err(error);
        };

        tracing::warn!(error = %error, component = %component, "Stage failure");
        if self.state != PipelineState::Error {
            self.transition(PipelineState::Error)?;
        }
        self.discard_turn();

        // A channel that failed mid-operation is in an unknown
        // protocol state; drop it and reopen on the next turn
        if component == Component::TranscriptionChannel {
            if let Some(mut channel) = self.channel.take() {
                let _ = channel.close().await;
            }
        }

        match self.recovery.record_failure(component) {
            RecoveryAction::Retry { delay } => {
                tokio::time::sleep(delay).await;
                self.transition(PipelineState::ListeningWake)?;
                Ok(())
            },
            RecoveryAction::Degrade => {
                self.observer.on_degraded_mode_change(component, true);
                self.refresh_classifier();
                self.transition(PipelineState::ListeningWake)?;
                Ok(())
            },
            RecoveryAction::Abort => {
                self.observer.on_error(&error);
                self.stop_to_idle().await;
                Err(error)
            },
        }
    }

    /// Swap in the energy fallback while the detector or the device is
    /// degraded; restore the primary classifier otherwise
    fn refresh_classifier(&mut self) {
        let fallback = self.recovery.is_degraded(Component::VoiceActivity)
            || self.recovery.is_degraded(Component::AudioDevice);
        if fallback {
            tracing::info!("Voice activity using energy-threshold fallback");
            self.segmenter.set_classifier(Arc::new(EnergySpeechClassifier::new(
                self.settings.segmenter.energy_floor_db,
            )));
        } else {
            tracing::info!("Voice activity using primary classifier");
            self.segmenter
                .set_classifier(Arc::clone(&self.primary_classifier));
        }
    }

    // ---- lifecycle helpers -----------------------------------------------

    fn begin_capture(&mut self) -> Result<()> {
        self.utterance = UtteranceBuffer::new();
        self.speech_start_idx = None;
        self.speech_end_idx = None;
        self.segmenter.reset();
        self.transition(PipelineState::ListeningSpeech)
    }

    fn discard_turn(&mut self) {
        self.utterance = UtteranceBuffer::new();
        self.speech_start_idx = None;
        self.speech_end_idx = None;
        self.response_text = None;
        self.segmenter.reset();
    }

    /// Move to `Idle` (via `Error` when no direct edge exists) and
    /// release every device and channel
    async fn stop_to_idle(&mut self) {
        if self.state != PipelineState::Idle {
            if !is_valid_transition(self.state, PipelineState::Idle) {
                if let Err(e) = self.transition(PipelineState::Error) {
                    tracing::error!(error = %e, "Transition to error during stop failed");
                }
            }
            if let Err(e) = self.transition(PipelineState::Idle) {
                tracing::error!(error = %e, "Transition to idle during stop failed");
            }
        }
        self.release_resources().await;
    }

    async fn release_resources(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
            self.watchdogs_canceled += 1;
        }
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                tracing::warn!(error = %e, "Channel close failed during stop");
            }
        }
        if let Err(e) = self.audio.close().await {
            tracing::warn!(error = %e, "Audio device close failed during stop");
        }
        tracing::info!("Voice pipeline stopped");
    }
}
