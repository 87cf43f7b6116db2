//! Audio egress: the PCM16 framer and the microphone capture bridge.
//!
//! # Capture design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block or do I/O, so it only down-mixes to mono and pushes into
//! a lock-free SPSC ring. A blocking pump thread drains the ring, resamples to
//! the session rate and cuts fixed-size `SampleBlock`s, which are handed to
//! async code over a bounded tokio channel.
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so the stream is created and
//! dropped on the pump thread itself.
//!
//! Blocks cut before anyone polls the stream are discarded, and the channel
//! holds only a few blocks, so the session never receives a backlog of
//! audio recorded before it started listening.

pub mod framer;
pub mod resample;

pub use framer::{sample_to_pcm16, AudioFrame, AudioFramer, FrameStream, MuteGate};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::{
    buffering::{chunk::SampleBlock, create_audio_ring, AudioConsumer, Consumer},
    error::{Result, VoxformError},
};
#[cfg(feature = "audio-cpal")]
use crate::buffering::{AudioProducer, Producer};
use resample::RateConverter;

/// Lazy source of capture blocks consumed by the orchestrator's audio task.
pub type SampleStream = BoxStream<'static, SampleBlock>;

/// Blocks buffered between the pump thread and the async consumer
/// (4 × 4096 samples ≈ 0.7 s at 24 kHz).
const BLOCK_CHANNEL_CAP: usize = 4;

/// Samples drained from the ring per pump iteration.
const DRAIN_CHUNK: usize = 1024;

/// Pump sleep when the ring is empty.
const EMPTY_SLEEP_MS: u64 = 5;

/// Capture bridge settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate the session expects (Hz). Default: 24000.
    pub target_sample_rate: u32,
    /// Samples per delivered block. Default: 4096.
    pub block_samples: usize,
    /// Input device name; `None` selects the system default.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 24_000,
            block_samples: 4_096,
            preferred_device: None,
        }
    }
}

/// Handle to a running microphone capture.
///
/// Dropping the handle (or calling `stop`) ends the pump thread, which
/// releases the device and closes the block stream.
pub struct MicCapture {
    running: Arc<AtomicBool>,
    /// Actual device sample rate (Hz).
    pub device_sample_rate: u32,
}

impl MicCapture {
    /// Open the input device and start delivering blocks.
    ///
    /// Resolves once the device is confirmed open (or fails). The device is
    /// opened on a blocking thread, so awaiting this never stalls a worker.
    pub async fn start(config: CaptureConfig) -> Result<(Self, SampleStream)> {
        let running = Arc::new(AtomicBool::new(true));
        let listening = Arc::new(AtomicBool::new(false));
        let (block_tx, block_rx) = mpsc::channel::<SampleBlock>(BLOCK_CHANNEL_CAP);
        let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();

        let thread_running = Arc::clone(&running);
        let thread_listening = Arc::clone(&listening);
        tokio::task::spawn_blocking(move || {
            let (producer, consumer) = create_audio_ring();
            let device = match open_input(
                producer,
                Arc::clone(&thread_running),
                config.preferred_device.as_deref(),
            ) {
                Ok(d) => {
                    let _ = open_tx.send(Ok(d.sample_rate));
                    d
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    thread_running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            pump_blocks(
                consumer,
                device.sample_rate,
                &config,
                &thread_running,
                &thread_listening,
                &block_tx,
            );

            // Stream drops here, on the thread that created it.
            drop(device);
            info!("capture pump stopped");
        });

        let device_sample_rate = match open_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoxformError::AudioDevice(
                    "capture thread died before opening the device".into(),
                ))
            }
        };

        info!(device_sample_rate, "microphone capture started");
        let blocks = blocks_from_channel(block_rx, listening);
        Ok((
            Self {
                running,
                device_sample_rate,
            },
            blocks,
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Turn a block receiver into the lazy `SampleStream` the orchestrator consumes.
///
/// `listening` is raised on the first poll; the pump discards blocks until then.
pub fn blocks_from_channel(
    rx: mpsc::Receiver<SampleBlock>,
    listening: Arc<AtomicBool>,
) -> SampleStream {
    futures::stream::unfold(rx, move |mut rx| {
        listening.store(true, Ordering::Release);
        async move { rx.recv().await.map(|block| (block, rx)) }
    })
    .boxed()
}

/// Drain the ring, resample, and emit fixed-size blocks until stopped or the
/// receiving side goes away. Never blocks on the channel: blocks that find
/// nobody listening, or a full channel, are dropped.
fn pump_blocks(
    mut consumer: AudioConsumer,
    capture_rate: u32,
    config: &CaptureConfig,
    running: &AtomicBool,
    listening: &AtomicBool,
    block_tx: &mpsc::Sender<SampleBlock>,
) {
    let mut converter = match RateConverter::new(capture_rate, config.target_sample_rate, DRAIN_CHUNK)
    {
        Ok(c) => c,
        Err(e) => {
            warn!("capture resampler unavailable: {e}");
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut pending: Vec<f32> = Vec::with_capacity(config.block_samples * 2);
    let mut blocks_sent = 0u64;
    let mut blocks_dropped = 0u64;

    while running.load(Ordering::Relaxed) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        }

        pending.extend(converter.process(&raw[..n]));
        while pending.len() >= config.block_samples {
            let samples: Vec<f32> = pending.drain(..config.block_samples).collect();
            if !listening.load(Ordering::Acquire) {
                blocks_dropped += 1;
                continue;
            }
            let block = SampleBlock::new(samples, config.target_sample_rate);
            match block_tx.try_send(block) {
                Ok(()) => blocks_sent += 1,
                Err(TrySendError::Full(_)) => {
                    blocks_dropped += 1;
                    if blocks_dropped % 50 == 1 {
                        warn!(blocks_dropped, "audio consumer is behind; dropping blocks");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(blocks_sent, blocks_dropped, "block receiver dropped; stopping capture");
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
    debug!(blocks_sent, blocks_dropped, "capture pump exiting");
}

/// Down-mix one interleaved callback buffer to mono into `mix`.
fn downmix<T: Copy>(data: &[T], channels: usize, mix: &mut Vec<f32>, convert: fn(T) -> f32) {
    let channels = channels.max(1);
    let frames = data.len() / channels;
    mix.resize(frames, 0.0);
    for (f, slot) in mix.iter_mut().enumerate() {
        let base = f * channels;
        let sum: f32 = data[base..base + channels].iter().map(|&s| convert(s)).sum();
        *slot = sum / channels as f32;
    }
}

/// An open cpal input stream plus its sample rate.
struct OpenInput {
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
fn open_input(
    producer: AudioProducer,
    running: Arc<AtomicBool>,
    preferred_device_name: Option<&str>,
) -> Result<OpenInput> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, StreamConfig};

    let host = cpal::default_host();
    let mut selected = None;

    if let Some(preferred) = preferred_device_name {
        match host.input_devices() {
            Ok(mut devices) => {
                selected = devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                if selected.is_none() {
                    warn!("preferred input device '{preferred}' not found, falling back");
                }
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    let device = match selected.or_else(|| host.default_input_device()) {
        Some(d) => d,
        None => host
            .input_devices()
            .map_err(|e| VoxformError::AudioDevice(e.to_string()))?
            .next()
            .ok_or(VoxformError::NoDefaultInputDevice)?,
    };

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| VoxformError::AudioDevice(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    info!(sample_rate, channels, "capture config selected");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_mono_stream::<f32>(&device, &config, producer, running, |s| s)
        }
        SampleFormat::I16 => {
            build_mono_stream::<i16>(&device, &config, producer, running, |s| s as f32 / 32_768.0)
        }
        SampleFormat::U8 => build_mono_stream::<u8>(&device, &config, producer, running, |s| {
            (s as f32 - 128.0) / 128.0
        }),
        fmt => {
            return Err(VoxformError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| VoxformError::AudioStream(e.to_string()))?;

    Ok(OpenInput {
        _stream: stream,
        sample_rate,
    })
}

#[cfg(feature = "audio-cpal")]
fn build_mono_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    convert: fn(T) -> f32,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + 'static,
{
    use cpal::traits::DeviceTrait;

    let channels = config.channels as usize;
    let mut mix: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                downmix(data, channels, &mut mix, convert);
                let written = producer.push_slice(&mix);
                if written < mix.len() {
                    warn!("capture ring full: dropped {} frames", mix.len() - written);
                }
            },
            |err| tracing::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| VoxformError::AudioStream(e.to_string()))
}

#[cfg(not(feature = "audio-cpal"))]
fn open_input(
    _producer: crate::buffering::AudioProducer,
    _running: Arc<AtomicBool>,
    _preferred_device_name: Option<&str>,
) -> Result<OpenInput> {
    Err(VoxformError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::Producer;

    #[test]
    fn downmix_averages_interleaved_channels() {
        let mut mix = Vec::new();
        downmix(&[0.5f32, -0.5, 1.0, 0.0], 2, &mut mix, |s| s);
        assert_eq!(mix, vec![0.0, 0.5]);

        downmix(&[i16::MIN, 0], 1, &mut mix, |s| s as f32 / 32_768.0);
        assert_eq!(mix, vec![-1.0, 0.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pump_cuts_fixed_blocks_in_order() {
        let (mut producer, consumer) = create_audio_ring();
        let ramp: Vec<f32> = (0..10).map(|i| i as f32 / 10.0).collect();
        producer.push_slice(&ramp);

        let config = CaptureConfig {
            target_sample_rate: 24_000,
            block_samples: 4,
            preferred_device: None,
        };
        let running = Arc::new(AtomicBool::new(true));
        let listening = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(8);

        let pump_running = Arc::clone(&running);
        let pump_listening = Arc::clone(&listening);
        let handle = tokio::task::spawn_blocking(move || {
            pump_blocks(consumer, 24_000, &config, &pump_running, &pump_listening, &tx);
        });

        let mut blocks = blocks_from_channel(rx, listening);
        let first = blocks.next().await.expect("first block");
        let second = blocks.next().await.expect("second block");
        running.store(false, Ordering::SeqCst);
        handle.await.expect("pump panicked");

        assert_eq!(first.samples, vec![0.0, 0.1, 0.2, 0.3]);
        assert_eq!(second.samples, vec![0.4, 0.5, 0.6, 0.7]);
        assert_eq!(first.sample_rate, 24_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocks_cut_before_the_first_poll_are_discarded() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&[0.5f32; 12]);

        let config = CaptureConfig {
            target_sample_rate: 24_000,
            block_samples: 4,
            preferred_device: None,
        };
        let running = Arc::new(AtomicBool::new(true));
        let listening = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel(8);

        let pump_running = Arc::clone(&running);
        let pump_listening = Arc::clone(&listening);
        let handle = tokio::task::spawn_blocking(move || {
            pump_blocks(consumer, 24_000, &config, &pump_running, &pump_listening, &tx);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.store(false, Ordering::SeqCst);
        handle.await.expect("pump panicked");

        assert!(rx.try_recv().is_err(), "stale blocks reached the channel");
    }

    #[tokio::test]
    async fn first_poll_raises_the_listening_flag() {
        let listening = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(1);
        let mut blocks = blocks_from_channel(rx, Arc::clone(&listening));
        assert!(!listening.load(Ordering::Acquire));

        tx.send(SampleBlock::silence(4, 24_000)).await.expect("send");
        assert!(blocks.next().await.is_some());
        assert!(listening.load(Ordering::Acquire));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn start_resolves_without_holding_the_runtime() {
        let ticker = tokio::spawn(async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        });
        // With or without an input device, `start` must resolve on a
        // single-threaded runtime and let other tasks run.
        let started =
            tokio::time::timeout(Duration::from_secs(5), MicCapture::start(CaptureConfig::default()))
                .await
                .expect("start never resolved");
        if let Ok((capture, _blocks)) = started {
            capture.stop();
        }
        ticker.await.expect("ticker task");
    }
}
