//! XOR checksum
//!
//! Every payload on the wire carries a single trailing checksum byte equal
//! to the XOR of all payload bytes. The empty payload checksums to zero.

/// Reduce a byte slice to its 1-byte XOR checksum.
#[inline]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}
