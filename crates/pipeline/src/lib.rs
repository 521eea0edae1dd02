//! Voice pipeline orchestration
//!
//! The finite state machine that turns a continuous microphone stream
//! into discrete conversational turns: wake-word detection, speech
//! capture with hysteresis segmentation, turn commitment to the speech
//! channel, reasoning, and synthesized playback with motion sync.
//!
//! Module layout:
//! - [`state`] - the state enum, transition table, and timeout policy
//! - [`segmenter`] - speech start/end detection around a classifier
//! - [`recovery`] - per-component failure tracking and backoff
//! - [`observer`] - optional synchronous observability hooks
//! - [`orchestrator`] - the state machine driving all of the above

pub mod observer;
pub mod orchestrator;
pub mod recovery;
pub mod segmenter;
pub mod state;

pub use observer::{NoopObserver, PipelineObserver};
pub use orchestrator::{Collaborators, PipelineHandle, VoicePipeline};
pub use recovery::{RecoveryAction, RecoveryManager};
pub use segmenter::{EnergySpeechClassifier, SegmentEvent, Segmenter};
pub use state::{PipelineState, StateTimeoutPolicy};
