//! Serial port abstraction
//!
//! This module defines the port abstraction the transport drives. A port is
//! responsible for byte-level I/O and line control (baud rate, RTS); it knows
//! nothing about framing or the message protocol.
//!
//! The [`SerialPort`] trait provides a uniform interface so the reader worker
//! and the write path can be agnostic to the backend:
//!
//! - **Hardware**: a real 8N1 UART with RTS/CTS flow control (via the
//!   `serialport` crate)
//! - **Loopback**: an in-memory device stub that answers echo and status
//!   requests, used by the test suite
//!
//! # Thread Safety
//!
//! Ports must be `Send` so a handle can move into the reader thread. The
//! reader gets its own handle via [`SerialPort::try_clone`]; clones share the
//! underlying device, so a read on one observes bytes regardless of which
//! handle wrote them.

use crate::Result;

pub mod hardware;
pub mod mock;

pub use hardware::HardwarePort;
pub use mock::LoopbackPort;

/// Byte-level serial port used by the transport.
///
/// # Lifecycle
///
/// 1. Construct a concrete port (path + baud rate)
/// 2. `open()` configures the line and clears stale buffers
/// 3. The transport clones a handle for its reader worker
/// 4. `close()` releases the OS handle; reopening is allowed
///
/// # Error Handling
///
/// `read` returns `Ok(0)` on a timeout with no data; hard I/O errors are
/// returned as `Err` and treated as fatal by the reader.
pub trait SerialPort: Send {
    /// Open and configure the port (8N1, RTS/CTS, buffers cleared, RTS
    /// asserted).
    fn open(&mut self) -> Result<()>;

    /// Close the port. Idempotent.
    fn close(&mut self);

    /// Whether the port is currently open.
    fn is_open(&self) -> bool;

    /// Currently configured baud rate.
    fn baud_rate(&self) -> u32;

    /// Reconfigure the baud rate.
    ///
    /// Applies to the live line when open, and to the next `open()`
    /// otherwise. Worker shutdown/restart around a rate change is the
    /// transport's job, not the port's.
    fn set_baud_rate(&mut self, rate: u32) -> Result<()>;

    /// Number of bytes already buffered for reading, if the backend knows.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the read timed out.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `data`, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Block until the transmit buffer has drained.
    fn flush(&mut self) -> Result<()>;

    /// Drive the RTS line directly (true = asserted).
    fn set_rts(&mut self, asserted: bool) -> Result<()>;

    /// Clone a handle to the same underlying device.
    fn try_clone(&self) -> Result<Box<dyn SerialPort>>;
}
