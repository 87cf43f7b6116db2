//! Typed sample block delivered by the capture bridge to the framer.

/// A contiguous block of mono f32 samples at a known sample rate.
///
/// The capture bridge decides the block size (4096 samples at 24 kHz in the
/// default configuration); the framer never re-cuts it.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// Mono f32 samples, nominally in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 24000).
    pub sample_rate: u32,
}

impl SampleBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A block of `len` zero samples.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    /// Returns the duration of this block in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the block contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_duration_at_session_rate() {
        let block = SampleBlock::silence(4096, 24_000);
        assert_eq!(block.len(), 4096);
        assert!((block.duration_secs() - 0.170_666).abs() < 1e-4);
        assert!(!block.is_empty());
    }
}
