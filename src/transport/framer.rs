//! Receive framer
//!
//! Accumulates raw bytes from the reader worker and splits them into COBS
//! frames on the `0x00` delimiter. The accumulator is bounded: a frame that
//! grows past [`MAX_FRAME_SIZE`] is dropped and the bytes already buffered
//! are discarded. Consecutive delimiters never produce empty frames.
//!
//! The framer also decides hardware flow control: when the backlog crosses
//! [`BUFFER_HIGH_WATER`] the RTS line is deasserted to push back on the
//! sender, and it is reasserted once the backlog falls below
//! [`BUFFER_LOW_WATER`]. Between the watermarks the line is left alone.

use crate::protocol::FRAME_DELIMITER;

/// Backlog size above which RTS is deasserted.
pub const BUFFER_HIGH_WATER: usize = 512;
/// Backlog size below which RTS is reasserted.
pub const BUFFER_LOW_WATER: usize = 64;
/// Largest encoded frame accepted, delimiter excluded.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Byte accumulator with delimiter splitting and RTS watermark hysteresis.
#[derive(Debug)]
pub struct Framer {
    acc: Vec<u8>,
    max_frame_size: usize,
    high_water: usize,
    low_water: usize,
    rts_asserted: bool,
}

impl Framer {
    pub fn new() -> Self {
        Self::with_limits(MAX_FRAME_SIZE, BUFFER_HIGH_WATER, BUFFER_LOW_WATER)
    }

    /// Framer with explicit limits. `low_water` must be below `high_water`.
    pub fn with_limits(max_frame_size: usize, high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water < high_water);
        Self {
            acc: Vec::with_capacity(max_frame_size.min(4096)),
            max_frame_size,
            high_water,
            low_water,
            rts_asserted: true,
        }
    }

    /// Feed one chunk of raw bytes, appending completed frames to `frames`.
    ///
    /// Returns `Some(level)` when the RTS line must change, `None` when it
    /// stays where it is. Watermarks are evaluated against the backlog as it
    /// stands when the chunk arrives, so a draining delimiter does not lift
    /// the back-pressure until the next chunk is seen.
    pub fn push_chunk(&mut self, chunk: &[u8], frames: &mut Vec<Vec<u8>>) -> Option<bool> {
        let backlog = self.acc.len() + chunk.len();
        let rts_change = if backlog > self.high_water && self.rts_asserted {
            self.rts_asserted = false;
            Some(false)
        } else if backlog < self.low_water && !self.rts_asserted {
            self.rts_asserted = true;
            Some(true)
        } else {
            None
        };

        for &byte in chunk {
            if byte == FRAME_DELIMITER {
                if !self.acc.is_empty() {
                    frames.push(std::mem::take(&mut self.acc));
                }
            } else {
                self.acc.push(byte);
                if self.acc.len() > self.max_frame_size {
                    log::warn!(
                        "frame exceeded {} bytes, discarding accumulated data",
                        self.max_frame_size
                    );
                    self.acc.clear();
                }
            }
        }

        rts_change
    }

    /// Drop any partially accumulated frame.
    pub fn clear(&mut self) {
        self.acc.clear();
    }

    /// Bytes currently buffered without a closing delimiter.
    pub fn len(&self) -> usize {
        self.acc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acc.is_empty()
    }

    /// Current RTS level the framer has decided.
    pub fn rts_asserted(&self) -> bool {
        self.rts_asserted
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}
