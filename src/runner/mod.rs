//! Test controllers
//!
//! The controllers compose the transport and probe into runnable tests:
//! latency bursts, baud-rate sweeps, and the stress scenario suite. All of
//! them run on the caller's thread; only the transport's reader/processor
//! pair runs in the background.

pub mod baud;
pub mod burst;
pub mod stress;
pub mod verdict;

use crate::protocol::{DEFAULT_MESSAGE_LENGTH, MAX_MESSAGE_LENGTH, MIN_MESSAGE_LENGTH};
use std::time::Duration;

/// Counters are two bytes, so a burst can address at most 65 536 samples.
pub const MAX_SAMPLES: usize = 1 << 16;

/// Wire overhead per echo message: two COBS overhead bytes, the delimiter,
/// and one byte of safety margin.
pub const WIRE_OVERHEAD_BYTES: u32 = 4;

/// Clamp an echo payload length into the valid 6..=10 range.
///
/// Out-of-range requests silently fall back to the default length.
pub fn clamp_message_length(length: u8) -> u8 {
    if (MIN_MESSAGE_LENGTH..=MAX_MESSAGE_LENGTH).contains(&length) {
        length
    } else {
        log::info!("message length {length} out of range, using {DEFAULT_MESSAGE_LENGTH}");
        DEFAULT_MESSAGE_LENGTH
    }
}

/// Clamp a sample count to the addressable counter space.
pub fn clamp_samples(samples: usize) -> usize {
    if samples > MAX_SAMPLES {
        log::warn!("samples {samples} exceeds counter space, clamping to {MAX_SAMPLES}");
        MAX_SAMPLES
    } else {
        samples
    }
}

/// Minimum per-message delay to let the UART transmit buffer drain:
/// `(length + overhead) * 10 bits / baud` seconds for an 8N1 line.
pub fn min_drain_delay(message_length: u8, baud: u32) -> Duration {
    let wire_bits = (message_length as u32 + WIRE_OVERHEAD_BYTES) * 10;
    Duration::from_secs_f64(wire_bits as f64 / baud as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_message_length() {
        assert_eq!(clamp_message_length(6), 6);
        assert_eq!(clamp_message_length(10), 10);
        assert_eq!(clamp_message_length(5), 10);
        assert_eq!(clamp_message_length(11), 10);
        assert_eq!(clamp_message_length(0), 10);
    }

    #[test]
    fn test_clamp_samples() {
        assert_eq!(clamp_samples(255), 255);
        assert_eq!(clamp_samples(MAX_SAMPLES), MAX_SAMPLES);
        assert_eq!(clamp_samples(MAX_SAMPLES + 1), MAX_SAMPLES);
    }

    #[test]
    fn test_min_drain_delay() {
        // (10 + 4) * 10 bits at 115200 baud.
        let delay = min_drain_delay(10, 115_200);
        assert!((delay.as_secs_f64() - 140.0 / 115_200.0).abs() < 1e-12);
        // Slower line, longer drain.
        assert!(min_drain_delay(10, 9600) > delay);
    }
}
