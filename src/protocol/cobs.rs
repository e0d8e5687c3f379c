//! COBS frame codec
//!
//! Consistent Overhead Byte Stuffing with a `0x00` packet delimiter. The
//! encoded body never contains a zero byte, so the receiver can split the
//! stream on bare zeros without inspecting frame contents.
//!
//! Encoding is total; decoding returns a typed, recoverable error on
//! malformed input so the pipeline can log and discard the frame.

use thiserror::Error;

/// Longest run of non-zero bytes a single code byte can cover.
const MAX_BLOCK: u8 = 0xFF;

/// Decode failure for a single COBS frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CobsError {
    /// A zero byte appeared inside the encoded body.
    #[error("zero byte inside encoded frame at offset {0}")]
    UnexpectedZero(usize),
    /// A code byte pointed past the end of the frame.
    #[error("encoded frame truncated: block short by {missing} byte(s)")]
    Truncated { missing: usize },
}

/// COBS-encode `data` into a byte string free of `0x00`.
///
/// The frame delimiter is not appended; callers add it when writing to the
/// wire.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 2);
    let mut code_at = 0;
    out.push(0);
    let mut code: u8 = 1;

    for &byte in data {
        if byte == 0 {
            out[code_at] = code;
            code_at = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == MAX_BLOCK {
                out[code_at] = code;
                code_at = out.len();
                out.push(0);
                code = 1;
            }
        }
    }

    out[code_at] = code;
    out
}

/// Invert [`encode`]. Empty input decodes to empty output.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        if code == 0 {
            return Err(CobsError::UnexpectedZero(i));
        }
        let block_len = code as usize - 1;
        let end = i + 1 + block_len;
        if end > data.len() {
            return Err(CobsError::Truncated {
                missing: end - data.len(),
            });
        }
        for (offset, &byte) in data[i + 1..end].iter().enumerate() {
            if byte == 0 {
                return Err(CobsError::UnexpectedZero(i + 1 + offset));
            }
            out.push(byte);
        }
        i = end;
        // A maximal block carries no implicit zero.
        if code != MAX_BLOCK && i < data.len() {
            out.push(0);
        }
    }

    Ok(out)
}
