//! Float sample blocks → signed 16-bit PCM frames.
//!
//! One input block yields exactly one output frame, in order. The framer
//! does no buffering or re-cutting across blocks; block size is the capture
//! bridge's decision.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::stream::{BoxStream, Stream, StreamExt};

use crate::buffering::chunk::SampleBlock;

/// Full-scale magnitude used for float → i16 conversion.
///
/// Symmetric on purpose: -1.0 maps to -32767, never -32768.
pub const PCM16_SCALE: f32 = 32_767.0;

/// Boxed stream of frames handed to `RealtimeSession::send_audio`.
pub type FrameStream = BoxStream<'static, AudioFrame>;

/// A fixed-length buffer of signed 16-bit mono samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position of this frame in the outbound sequence, starting at 0.
    pub seq: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Little-endian PCM16 bytes, the layout the session expects on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert one float sample to PCM16.
///
/// Clamps to [-1.0, 1.0] first, then scales by 32767 and rounds half away
/// from zero. NaN becomes silence.
#[inline]
pub fn sample_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE).round() as i16
}

/// Shared mute switch for outbound audio.
///
/// While set, the framer replaces every block with silence of the same
/// length, so the stream keeps its cadence and server-side VAD sees quiet
/// rather than a gap.
#[derive(Debug, Clone, Default)]
pub struct MuteGate(Arc<AtomicBool>);

impl MuteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_muted(&self, muted: bool) {
        self.0.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Converts sample blocks into PCM16 frames.
#[derive(Debug, Default)]
pub struct AudioFramer {
    gate: MuteGate,
    next_seq: u64,
}

impl AudioFramer {
    pub fn new(gate: MuteGate) -> Self {
        Self { gate, next_seq: 0 }
    }

    /// Frame a single block.
    pub fn frame(&mut self, block: &SampleBlock) -> AudioFrame {
        let samples = if self.gate.is_muted() {
            vec![0i16; block.samples.len()]
        } else {
            block.samples.iter().copied().map(sample_to_pcm16).collect()
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        AudioFrame { seq, samples }
    }

    /// Number of frames produced so far.
    pub fn frames_produced(&self) -> u64 {
        self.next_seq
    }

    /// Adapt a lazy block stream into a lazy frame stream.
    pub fn into_frames<S>(mut self, blocks: S) -> FrameStream
    where
        S: Stream<Item = SampleBlock> + Send + 'static,
    {
        blocks.map(move |block| self.frame(&block)).boxed()
    }
}
