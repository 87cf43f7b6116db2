//! Device-rate → session-rate conversion.
//!
//! Microphones and WAV files arrive at 44.1 or 48 kHz while the session takes
//! 24 kHz mono. The capture pump feeds `RateConverter::process` continuously;
//! file sources call `finish` after the last sample so the tail that never
//! filled a rubato chunk is still converted.
//!
//! Output is aligned with the input: the resampler's filter delay is
//! discarded from the front, and after `finish` the total output length is
//! `round(input_len * target / source)`.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{Result, VoxformError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when the rates already match.
    stage: Option<Stage>,
}

struct Stage {
    resampler: FastFixedIn<f32>,
    ratio: f64,
    chunk_size: usize,
    /// Input not yet handed to rubato.
    pending: Vec<f32>,
    /// `[1][output_frames_max]`, reused across calls.
    scratch: Vec<Vec<f32>>,
    /// Leading output frames still to drop (filter delay).
    lead_in: usize,
    samples_in: u64,
    samples_out: u64,
}

impl RateConverter {
    /// `chunk_size` is the number of input frames rubato consumes per call.
    ///
    /// # Errors
    /// Returns `VoxformError::AudioDevice` if rubato rejects the ratio.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self { stage: None });
        }

        let ratio = f64::from(target_rate) / f64::from(source_rate);
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| VoxformError::AudioDevice(format!("resampler init: {e}")))?;
        let lead_in = resampler.output_delay();
        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];
        info!(source_rate, target_rate, chunk_size, "resampling to session rate");

        Ok(Self {
            stage: Some(Stage {
                resampler,
                ratio,
                chunk_size,
                pending: Vec::with_capacity(chunk_size * 2),
                scratch,
                lead_in,
                samples_in: 0,
                samples_out: 0,
            }),
        })
    }

    /// Feed source-rate samples and take whatever target-rate samples are ready.
    ///
    /// Input shorter than one chunk is held until more arrives or `finish`.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(stage) = self.stage.as_mut() else {
            return samples.to_vec();
        };

        stage.samples_in += samples.len() as u64;
        stage.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        let mut offset = 0;
        while stage.pending.len() - offset >= stage.chunk_size {
            let chunk = &stage.pending[offset..offset + stage.chunk_size];
            let result = stage
                .resampler
                .process_into_buffer(&[chunk], &mut stage.scratch, None);
            match result {
                Ok((_, produced)) => stage.emit(produced, &mut out),
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += stage.chunk_size;
        }
        stage.pending.drain(..offset);
        out
    }

    /// Convert the held-back tail and flush the filter, then reset for a new
    /// stream. Empty in passthrough mode.
    pub fn finish(&mut self) -> Vec<f32> {
        let Some(stage) = self.stage.as_mut() else {
            return Vec::new();
        };

        let expected = (stage.samples_in as f64 * stage.ratio).round() as u64;
        let mut out = Vec::new();

        let tail = std::mem::take(&mut stage.pending);
        if !tail.is_empty() {
            let result = stage.resampler.process_partial_into_buffer(
                Some(&[&tail[..]][..]),
                &mut stage.scratch,
                None,
            );
            match result {
                Ok((_, produced)) => stage.emit(produced, &mut out),
                Err(e) => error!("resampler flush error: {e}"),
            }
        }

        // The delay line still holds real samples; push silence until the
        // output catches up with the input.
        let mut flushes = 0;
        while stage.samples_out < expected && flushes < 4 {
            let result = stage.resampler.process_partial_into_buffer(
                None::<&[&[f32]]>,
                &mut stage.scratch,
                None,
            );
            match result {
                Ok((_, produced)) => stage.emit(produced, &mut out),
                Err(e) => {
                    error!("resampler flush error: {e}");
                    break;
                }
            }
            flushes += 1;
        }

        let excess = stage.samples_out.saturating_sub(expected) as usize;
        out.truncate(out.len().saturating_sub(excess));

        stage.resampler.reset();
        stage.lead_in = stage.resampler.output_delay();
        stage.samples_in = 0;
        stage.samples_out = 0;
        out
    }

    /// Source and target rates are equal.
    pub fn is_passthrough(&self) -> bool {
        self.stage.is_none()
    }
}

impl Stage {
    fn emit(&mut self, produced: usize, out: &mut Vec<f32>) {
        let frames = &self.scratch[0][..produced];
        let skip = self.lead_in.min(frames.len());
        self.lead_in -= skip;
        let frames = &frames[skip..];
        self.samples_out += frames.len() as u64;
        out.extend_from_slice(frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn matching_rates_pass_samples_through() {
        let mut rc = RateConverter::new(24_000, 24_000, 1024).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..300).map(|i| i as f32 * 0.001).collect();
        let out = rc.process(&samples);
        assert_eq!(out.len(), samples.len());
        assert_relative_eq!(out[299], 0.299, epsilon = 1e-6);
        assert!(rc.finish().is_empty());
    }

    #[test]
    fn short_input_is_held_until_a_full_chunk_arrives() {
        let mut rc = RateConverter::new(48_000, 24_000, 1024).unwrap();
        assert!(rc.process(&vec![0.0f32; 600]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 600]).is_empty());
    }

    #[test]
    fn finish_converts_the_tail_below_one_chunk() {
        let mut rc = RateConverter::new(48_000, 24_000, 1024).unwrap();
        let mut out = rc.process(&[0.5f32; 2_000]);
        assert!(out.len() < 1_000);
        out.extend(rc.finish());
        assert_eq!(out.len(), 1_000);
        assert_relative_eq!(out[500], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn output_length_follows_the_rate_ratio() {
        let mut rc = RateConverter::new(44_100, 24_000, 1024).unwrap();
        let input = vec![0.25f32; 44_100 / 2 + 37];
        let mut out = rc.process(&input);
        out.extend(rc.finish());
        let expected = (input.len() as f64 * 24_000.0 / 44_100.0).round() as usize;
        assert_eq!(out.len(), expected);
    }

    #[test]
    fn finish_resets_for_the_next_stream() {
        let mut rc = RateConverter::new(48_000, 24_000, 1024).unwrap();
        rc.process(&[0.1f32; 3_000]);
        rc.finish();
        let mut out = rc.process(&[0.1f32; 500]);
        out.extend(rc.finish());
        assert_eq!(out.len(), 250);
    }
}
