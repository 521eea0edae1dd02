//! Audio chunk types and utilities

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Supported audio sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - Telephony
    Hz8000,
    /// 16kHz - Standard speech recognition
    #[default]
    Hz16000,
    /// 22.05kHz - Synthesis output
    Hz22050,
    /// 44.1kHz - CD quality
    Hz44100,
    /// 48kHz - Professional audio
    Hz48000,
}

impl SampleRate {
    /// Get sample rate as u32
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Number of samples in a chunk of the given duration
    pub fn samples_for_ms(&self, ms: u32) -> usize {
        (self.as_u32() as usize * ms as usize) / 1000
    }

    /// Build from a raw rate, if it is one we support
    pub fn from_u32(rate: u32) -> Option<Self> {
        match rate {
            8000 => Some(SampleRate::Hz8000),
            16000 => Some(SampleRate::Hz16000),
            22050 => Some(SampleRate::Hz22050),
            44100 => Some(SampleRate::Hz44100),
            48000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }
}

/// Immutable fixed-length buffer of signed 16-bit samples.
///
/// Produced by the audio device manager, tagged with a monotonic
/// sequence number so downstream stages can verify capture order.
/// Never mutated in place; operations that change samples return a
/// new chunk.
#[derive(Clone)]
pub struct AudioChunk {
    /// Raw PCM samples (mono)
    pub samples: Arc<[i16]>,
    /// Sample rate
    pub sample_rate: SampleRate,
    /// Monotonic sequence number assigned at capture
    pub sequence: u64,
    /// Timestamp when the chunk was captured/generated
    pub timestamp: Instant,
    /// Duration of this chunk
    pub duration: Duration,
    /// RMS energy in dB (relative to full scale)
    pub energy_db: f32,
}

impl std::fmt::Debug for AudioChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioChunk")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("sequence", &self.sequence)
            .field("duration", &self.duration)
            .field("energy_db", &self.energy_db)
            .finish()
    }
}

const PCM16_NORMALIZE: f32 = 32768.0;
const PCM16_SCALE: f32 = 32767.0;

impl AudioChunk {
    /// Create a new chunk from i16 samples
    pub fn new(samples: Vec<i16>, sample_rate: SampleRate, sequence: u64) -> Self {
        let duration =
            Duration::from_secs_f64(samples.len() as f64 / sample_rate.as_u32() as f64);
        let energy_db = Self::calculate_energy_db(&samples);

        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
            timestamp: Instant::now(),
            duration,
            energy_db,
        }
    }

    /// Create from normalized f32 samples in [-1.0, 1.0]
    pub fn from_f32(samples: &[f32], sample_rate: SampleRate, sequence: u64) -> Self {
        let pcm: Vec<i16> = samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * PCM16_SCALE) as i16)
            .collect();
        Self::new(pcm, sample_rate, sequence)
    }

    /// A chunk of pure silence with the given duration
    pub fn silence(ms: u32, sample_rate: SampleRate, sequence: u64) -> Self {
        Self::new(vec![0i16; sample_rate.samples_for_ms(ms)], sample_rate, sequence)
    }

    /// Convert samples to normalized f32
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&s| s as f32 / PCM16_NORMALIZE)
            .collect()
    }

    /// Convert from PCM16 bytes (little-endian)
    pub fn from_pcm16_bytes(bytes: &[u8], sample_rate: SampleRate, sequence: u64) -> Self {
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        Self::new(samples, sample_rate, sequence)
    }

    /// Convert to PCM16 bytes (little-endian)
    pub fn to_pcm16_bytes(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    /// Calculate RMS energy in decibels
    fn calculate_energy_db(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return -96.0;
        }

        let sum_squares: f64 = samples
            .iter()
            .map(|&s| {
                let norm = s as f64 / PCM16_NORMALIZE as f64;
                norm * norm
            })
            .sum();
        let rms = (sum_squares / samples.len() as f64).sqrt() as f32;

        if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            -96.0
        }
    }

    /// Peak amplitude normalized to [0.0, 1.0], forwarded to the motion sink
    pub fn amplitude(&self) -> f32 {
        self.samples
            .iter()
            .map(|&s| (s as f32 / PCM16_NORMALIZE).abs())
            .fold(0.0, f32::max)
    }

    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// High-quality resampling using Rubato (FFT-based).
    ///
    /// Falls back to linear interpolation for very short chunks where
    /// the FFT resampler cannot be constructed.
    pub fn resample(&self, target_rate: SampleRate) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target_rate {
            return self.clone();
        }

        let from_rate = self.sample_rate.as_u32() as usize;
        let to_rate = target_rate.as_u32() as usize;

        if self.samples.len() < 64 {
            return self.resample_linear(target_rate);
        }

        let samples_f64: Vec<f64> = self
            .samples
            .iter()
            .map(|&s| s as f64 / PCM16_NORMALIZE as f64)
            .collect();
        let chunk_size = self.samples.len().min(1024);

        match FftFixedIn::<f64>::new(from_rate, to_rate, chunk_size, 2, 1) {
            Ok(mut resampler) => {
                let input_frames = vec![samples_f64];
                match resampler.process(&input_frames, None) {
                    Ok(output_frames) => {
                        let resampled: Vec<i16> = output_frames[0]
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * PCM16_SCALE as f64) as i16)
                            .collect();
                        let mut chunk = Self::new(resampled, target_rate, self.sequence);
                        chunk.timestamp = self.timestamp;
                        chunk
                    },
                    Err(e) => {
                        tracing::warn!("Rubato processing failed, using linear fallback: {}", e);
                        self.resample_linear(target_rate)
                    },
                }
            },
            Err(e) => {
                tracing::warn!("Rubato init failed, using linear fallback: {}", e);
                self.resample_linear(target_rate)
            },
        }
    }

    /// Linear interpolation fallback for edge cases
    fn resample_linear(&self, target_rate: SampleRate) -> Self {
        let ratio = target_rate.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;

        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = src_idx - idx_floor as f64;

            let sample = self.samples[idx_floor] as f64 * (1.0 - frac)
                + self.samples[idx_ceil] as f64 * frac;
            resampled.push(sample as i16);
        }

        let mut chunk = Self::new(resampled, target_rate, self.sequence);
        chunk.timestamp = self.timestamp;
        chunk
    }
}

/// Ordered, append-only buffer of chunks accumulated between a
/// speech-start and speech-end event.
///
/// Owned by the orchestrator for the duration of one turn and dropped
/// (not reused) after commit or abandonment. A commit requires the
/// buffer to be non-empty, contiguous in sequence numbers, and at
/// least the minimum utterance duration.
#[derive(Debug, Default)]
pub struct UtteranceBuffer {
    chunks: Vec<AudioChunk>,
    gap_detected: bool,
}

impl UtteranceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Non-monotonic sequence numbers mark the buffer
    /// as gapped; a gapped buffer is invalid to commit.
    pub fn push(&mut self, chunk: AudioChunk) {
        if let Some(last) = self.chunks.last() {
            if chunk.sequence != last.sequence + 1 {
                tracing::warn!(
                    expected = last.sequence + 1,
                    got = chunk.sequence,
                    "Utterance buffer sequence gap"
                );
                self.gap_detected = true;
            }
        }
        self.chunks.push(chunk);
    }

    /// Total buffered duration
    pub fn duration(&self) -> Duration {
        self.chunks.iter().map(|c| c.duration).sum()
    }

    /// Every chunk present with contiguous sequence numbers
    pub fn is_contiguous(&self) -> bool {
        !self.gap_detected
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Iterate chunks in capture order
    pub fn chunks(&self) -> impl Iterator<Item = &AudioChunk> {
        self.chunks.iter()
    }

    /// Sequence number range covered by the buffer
    pub fn sequence_range(&self) -> Option<(u64, u64)> {
        match (self.chunks.first(), self.chunks.last()) {
            (Some(first), Some(last)) => Some((first.sequence, last.sequence)),
            _ => None,
        }
    }
}
