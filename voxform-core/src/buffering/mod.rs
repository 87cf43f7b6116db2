//! Capture-side buffering.
//!
//! The ring sits between the cpal callback and the block pump and carries
//! mono samples at the *device* rate, before conversion to the session's
//! 24 kHz. `HeapRb::push_slice` is wait-free, so the realtime callback never
//! blocks on the pump.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, owned by the audio callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, owned by the block pump.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Highest device rate the ring is sized for.
pub const MAX_DEVICE_RATE: usize = 192_000;

/// Pump stall the ring must absorb at `MAX_DEVICE_RATE` before the callback
/// starts dropping samples.
pub const MAX_PUMP_STALL_MS: usize = 1_000;

/// Ring capacity in samples: one stall at the highest device rate, rounded
/// up to a power of two (262 144 ≈ 5.5 s at 48 kHz).
pub const RING_CAPACITY: usize = (MAX_DEVICE_RATE * MAX_PUMP_STALL_MS / 1_000).next_power_of_two();

pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_holds_a_full_stall_at_the_highest_device_rate() {
        assert_eq!(RING_CAPACITY, 1 << 18);
        let (mut producer, consumer) = create_audio_ring();
        let second = vec![0.25f32; MAX_DEVICE_RATE];
        assert_eq!(producer.push_slice(&second), MAX_DEVICE_RATE);
        assert_eq!(consumer.occupied_len(), MAX_DEVICE_RATE);
    }
}
