//! WAV-file audio source and playback sink.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, info};
use voxform_core::audio::resample::RateConverter;
use voxform_core::playback::{PlaybackChunk, PlaybackSink};
use voxform_core::{SampleBlock, SampleStream};

/// Read a WAV file as mono blocks of `block_samples` at `target_rate`.
/// The trailing partial block is zero-padded.
pub fn read_blocks(path: &Path, target_rate: u32, block_samples: usize) -> anyhow::Result<Vec<SampleBlock>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    let mut converter = RateConverter::new(spec.sample_rate, target_rate, 1024)?;
    let mut samples = converter.process(&mono);
    samples.extend(converter.finish());
    let remainder = samples.len() % block_samples;
    if remainder != 0 {
        samples.resize(samples.len() + block_samples - remainder, 0.0);
    }
    info!(
        path = %path.display(),
        source_rate = spec.sample_rate,
        blocks = samples.len() / block_samples,
        "loaded input audio"
    );
    Ok(samples
        .chunks(block_samples)
        .map(|chunk| SampleBlock::new(chunk.to_vec(), target_rate))
        .collect())
}

/// Deliver blocks at real-time pace, the way a microphone would.
pub fn paced(blocks: Vec<SampleBlock>) -> SampleStream {
    stream::iter(blocks)
        .then(|block| async move {
            tokio::time::sleep(Duration::from_secs_f64(block.duration_secs())).await;
            block
        })
        .boxed()
}

/// Endless silence at real-time pace, for runs without an input file.
pub fn silence(sample_rate: u32, block_samples: usize) -> SampleStream {
    paced_repeat(SampleBlock::silence(block_samples, sample_rate))
}

fn paced_repeat(block: SampleBlock) -> SampleStream {
    stream::repeat(block)
        .then(|block| async move {
            tokio::time::sleep(Duration::from_secs_f64(block.duration_secs())).await;
            block
        })
        .boxed()
}

/// Writes played PCM16 chunks into a mono WAV file.
pub struct WavPlaybackSink {
    writer: hound::WavWriter<BufWriter<File>>,
    chunks: u64,
    stops: u64,
}

impl WavPlaybackSink {
    pub fn create(path: &Path, sample_rate: u32) -> anyhow::Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self {
            writer,
            chunks: 0,
            stops: 0,
        })
    }

    pub fn finalize(self) -> anyhow::Result<()> {
        info!(chunks = self.chunks, stops = self.stops, "playback file written");
        self.writer.finalize()?;
        Ok(())
    }
}

#[async_trait]
impl PlaybackSink for WavPlaybackSink {
    async fn play(&mut self, chunk: &PlaybackChunk) -> voxform_core::Result<()> {
        for pair in chunk.data.chunks_exact(2) {
            self.writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| voxform_core::VoxformError::AudioDevice(e.to_string()))?;
        }
        self.chunks += 1;
        Ok(())
    }

    async fn stop(&mut self) {
        // Already-written samples stay; the file records what was heard.
        self.stops += 1;
        debug!("playback stopped by barge-in");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_padded_to_full_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("in.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("create");
        for _ in 0..5_000 {
            writer.write_sample(16_384i16).expect("left");
            writer.write_sample(0i16).expect("right");
        }
        writer.finalize().expect("finalize");

        let blocks = read_blocks(&path, 24_000, 4_096).expect("read");
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 4_096));
        assert!((blocks[0].samples[0] - 0.25).abs() < 1e-4);
        assert_eq!(blocks[1].samples[4_095], 0.0);
    }

    #[test]
    fn resampled_input_keeps_its_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("in48k.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("create");
        for _ in 0..8_192 + 2_000 {
            writer.write_sample(8_192i16).expect("sample");
        }
        writer.finalize().expect("finalize");

        // 10 192 samples at 48 kHz → 5 096 at 24 kHz: one full block plus
        // 1 000 real samples in the second, the rest padding.
        let blocks = read_blocks(&path, 24_000, 4_096).expect("read");
        assert_eq!(blocks.len(), 2);
        let tail = &blocks[1].samples;
        assert!((tail[900] - 0.25).abs() < 1e-2, "tail sample {}", tail[900]);
        assert_eq!(tail[1_000], 0.0);
    }

    #[tokio::test]
    async fn sink_writes_pcm16_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.wav");
        let mut sink = WavPlaybackSink::create(&path, 24_000).expect("create");
        let data: Vec<u8> = [100i16, -200, 300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        sink.play(&PlaybackChunk { seq: 0, data }).await.expect("play");
        sink.finalize().expect("finalize");

        let mut reader = hound::WavReader::open(&path).expect("open");
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();
        assert_eq!(samples, vec![100, -200, 300]);
    }
}
