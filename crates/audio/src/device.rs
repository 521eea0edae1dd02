//! cpal-backed audio device manager
//!
//! The cpal streams are owned by a dedicated OS thread (cpal stream
//! handles are not `Send`); the async side talks to it through
//! channels. Capture assembles fixed-size chunks at the device rate,
//! resamples them to the pipeline processing rate, and tags each with
//! a monotonic sequence number. Playback resamples synthesized chunks
//! back to the device rate and feeds the output callback from a shared
//! queue.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate as CpalRate, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use companion_config::AudioSettings;
use companion_core::{AudioChunk, AudioIo, Error, Result, SampleRate};

use crate::health::HealthMonitor;

/// Device rates tried in preference order when opening streams
const PREFERRED_RATES: &[u32] = &[16_000, 48_000, 44_100, 22_050, 8_000];

/// Capture chunks buffered between the device thread and the reader
const CAPTURE_QUEUE_CHUNKS: usize = 32;

/// Playback queue cap, in seconds of device-rate audio
const PLAYBACK_QUEUE_SECS: usize = 4;

/// Shared playback queue: device-rate mono f32 samples
type PlaybackQueue = Arc<Mutex<VecDeque<f32>>>;

/// Device-backed [`AudioIo`] implementation
pub struct DeviceAudio {
    chunk_period: Duration,
    output_rate: SampleRate,
    chunk_rx: tokio::sync::Mutex<mpsc::Receiver<AudioChunk>>,
    playback: PlaybackQueue,
    playback_cap: usize,
    health: Arc<HealthMonitor>,
    shutdown_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DeviceAudio {
    /// Open the default capture and playback devices in shared mode.
    ///
    /// Fails with a device error when no device is available or no
    /// supported sample rate can be negotiated.
    pub fn open(settings: &AudioSettings) -> Result<Self> {
        let target_rate = SampleRate::from_u32(settings.sample_rate)
            .ok_or_else(|| Error::Config(format!("unsupported sample rate {}", settings.sample_rate)))?;
        let chunk_period = settings.chunk_duration();

        let health = Arc::new(HealthMonitor::new(
            chunk_period,
            settings.staleness_multiple,
            settings.max_playback_failures,
        ));

        let (chunk_tx, chunk_rx) = mpsc::channel(CAPTURE_QUEUE_CHUNKS);
        let playback: PlaybackQueue = Arc::new(Mutex::new(VecDeque::new()));
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<SampleRate>>();

        let thread = {
            let playback = Arc::clone(&playback);
            let chunk_ms = settings.chunk_ms;
            let settle_chunks = settings.settle_chunks;
            std::thread::Builder::new()
                .name("companion-audio".to_string())
                .spawn(move || {
                    device_thread(
                        target_rate,
                        chunk_ms,
                        settle_chunks,
                        chunk_tx,
                        playback,
                        open_tx,
                        shutdown_rx,
                    )
                })
                .map_err(|e| Error::Device(format!("failed to spawn audio thread: {e}")))?
        };

        // Wait for the thread to report stream construction
        let output_rate = open_rx
            .recv()
            .map_err(|_| Error::Device("audio thread exited during open".to_string()))??;

        let playback_cap = output_rate.as_u32() as usize * PLAYBACK_QUEUE_SECS;

        tracing::info!(
            target_rate = target_rate.as_u32(),
            output_rate = output_rate.as_u32(),
            chunk_ms = settings.chunk_ms,
            "Audio devices opened (shared mode)"
        );

        Ok(Self {
            chunk_period,
            output_rate,
            chunk_rx: tokio::sync::Mutex::new(chunk_rx),
            playback,
            playback_cap,
            health,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Health monitor, shared with periodic pipeline checks
    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }
}

#[async_trait]
impl AudioIo for DeviceAudio {
    async fn read_chunk(&self) -> Result<AudioChunk> {
        let mut rx = self.chunk_rx.lock().await;
        match tokio::time::timeout(self.health.staleness_limit(), rx.recv()).await {
            Ok(Some(chunk)) => {
                self.health.record_read();
                Ok(chunk)
            },
            Ok(None) => Err(Error::Device("capture stream closed".to_string())),
            Err(_) => Err(Error::Device(format!(
                "no capture data within {:?}",
                self.health.staleness_limit()
            ))),
        }
    }

    async fn play_chunk(&self, chunk: &AudioChunk) -> Result<()> {
        let device_chunk = chunk.resample(self.output_rate);
        let samples = device_chunk.to_f32();

        let overflow = {
            let mut queue = self.playback.lock();
            if queue.len() + samples.len() > self.playback_cap {
                true
            } else {
                queue.extend(samples);
                false
            }
        };

        self.health.record_playback(!overflow);
        if overflow {
            self.health.check()?;
            return Err(Error::Device("playback queue overflow".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // Stream teardown is fast; join off the async threads
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        tracing::info!("Audio devices closed");
        Ok(())
    }

    fn chunk_duration(&self) -> Duration {
        self.chunk_period
    }
}

/// Owns the cpal streams for the life of the device. Reports the
/// negotiated output rate (or the open error) once, then parks until
/// shutdown.
fn device_thread(
    target_rate: SampleRate,
    chunk_ms: u32,
    settle_chunks: u32,
    chunk_tx: mpsc::Sender<AudioChunk>,
    playback: PlaybackQueue,
    open_tx: std::sync::mpsc::Sender<Result<SampleRate>>,
    shutdown_rx: std::sync::mpsc::Receiver<()>,
) {
    let built = build_streams(target_rate, chunk_ms, settle_chunks, chunk_tx, playback);
    match built {
        Ok((input, output, output_rate)) => {
            if let Err(e) = input.play().and_then(|_| output.play()) {
                let _ = open_tx.send(Err(Error::Device(format!("failed to start streams: {e}"))));
                return;
            }
            let _ = open_tx.send(Ok(output_rate));
            // Streams stay alive until shutdown or sender drop
            let _ = shutdown_rx.recv();
            drop(input);
            drop(output);
        },
        Err(e) => {
            let _ = open_tx.send(Err(e));
        },
    }
}

fn build_streams(
    target_rate: SampleRate,
    chunk_ms: u32,
    settle_chunks: u32,
    chunk_tx: mpsc::Sender<AudioChunk>,
    playback: PlaybackQueue,
) -> Result<(cpal::Stream, cpal::Stream, SampleRate)> {
    let host = cpal::default_host();

    let input_device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no default input device".to_string()))?;
    let output_device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no default output device".to_string()))?;

    let (input_config, input_rate) = negotiate_config(
        &input_device,
        input_device
            .supported_input_configs()
            .map_err(|e| Error::Device(format!("input config query failed: {e}")))?,
    )?;
    let (output_config, output_rate) = negotiate_config(
        &output_device,
        output_device
            .supported_output_configs()
            .map_err(|e| Error::Device(format!("output config query failed: {e}")))?,
    )?;

    let input_stream = build_input_stream(
        &input_device,
        &input_config,
        input_rate,
        target_rate,
        chunk_ms,
        settle_chunks,
        chunk_tx,
    )?;
    let output_stream = build_output_stream(&output_device, &output_config, playback)?;

    Ok((input_stream, output_stream, output_rate))
}

/// Pick the first preferred rate the device supports
fn negotiate_config(
    device: &cpal::Device,
    supported: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
) -> Result<(StreamConfig, SampleRate)> {
    let ranges: Vec<_> = supported.collect();
    for &rate in PREFERRED_RATES {
        for range in &ranges {
            if range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0 {
                let config = range.with_sample_rate(CpalRate(rate)).config();
                // PREFERRED_RATES only contains representable rates
                let sample_rate = SampleRate::from_u32(rate)
                    .ok_or_else(|| Error::Device(format!("unrepresentable rate {rate}")))?;
                return Ok((config, sample_rate));
            }
        }
    }

    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    Err(Error::Device(format!(
        "device '{name}' supports none of the preferred sample rates"
    )))
}

fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    device_rate: SampleRate,
    target_rate: SampleRate,
    chunk_ms: u32,
    settle_chunks: u32,
    chunk_tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let device_chunk_len = device_rate.samples_for_ms(chunk_ms);

    let mut accumulator: Vec<f32> = Vec::with_capacity(device_chunk_len * 2);
    let mut sequence: u64 = 0;
    let mut settle_remaining = settle_chunks;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[f32], _| {
                // Downmix interleaved channels to mono
                accumulator.extend(data.chunks(channels).map(|frame| {
                    frame.iter().sum::<f32>() / channels as f32
                }));

                while accumulator.len() >= device_chunk_len {
                    let device_samples: Vec<f32> =
                        accumulator.drain(..device_chunk_len).collect();

                    // Mic settling: discard the first chunks after open
                    if settle_remaining > 0 {
                        settle_remaining -= 1;
                        continue;
                    }

                    let chunk = AudioChunk::from_f32(&device_samples, device_rate, sequence)
                        .resample(target_rate);
                    sequence += 1;

                    if chunk_tx.try_send(chunk).is_err() {
                        // Reader stalled; dropping here is visible as a
                        // sequence gap downstream, never silent reuse
                        tracing::warn!(sequence, "capture queue full, dropping chunk");
                    }
                }
            },
            |e| tracing::error!(error = %e, "input stream error"),
            None,
        )
        .map_err(|e| Error::Device(format!("failed to build input stream: {e}")))?;

    Ok(stream)
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    playback: PlaybackQueue,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _| {
                let mut queue = playback.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |e| tracing::error!(error = %e, "output stream error"),
            None,
        )
        .map_err(|e| Error::Device(format!("failed to build output stream: {e}")))?;

    Ok(stream)
}
