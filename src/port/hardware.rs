//! Hardware UART adapter
//!
//! Wraps the `serialport` crate behind the [`SerialPort`] trait. The line is
//! configured 8N1 with hardware RTS/CTS and no XON/XOFF; input and output
//! buffers are cleared right after open and RTS starts asserted so the
//! device may transmit immediately.

use crate::port::SerialPort;
use crate::Result;
use anyhow::Context;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Read timeout for the blocking reader loop.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Real UART port backed by the operating system.
pub struct HardwarePort {
    path: String,
    baud: u32,
    inner: Option<Box<dyn serialport::SerialPort>>,
}

impl HardwarePort {
    /// Create an unopened port for `path` at `baud`.
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            inner: None,
        }
    }

    fn inner_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("serial port {} is not open", self.path))
    }
}

impl SerialPort for HardwarePort {
    fn open(&mut self) -> Result<()> {
        let mut port = serialport::new(self.path.as_str(), self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Hardware)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("failed to open serial port {}", self.path))?;

        // Drop whatever accumulated while nobody was listening.
        port.clear(ClearBuffer::All)
            .context("failed to clear serial buffers")?;
        port.write_request_to_send(true)
            .context("failed to assert RTS")?;

        log::info!("serial port opened: {} @ {} baud", self.path, self.baud);
        self.inner = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            log::info!("serial port closed: {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<()> {
        if let Some(port) = self.inner.as_mut() {
            port.set_baud_rate(rate)
                .with_context(|| format!("failed to set baud rate {rate}"))?;
        }
        self.baud = rate;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        let port = self.inner_mut()?;
        Ok(port.bytes_to_read().context("bytes_to_read failed")? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let port = self.inner_mut()?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e).context("serial read failed"),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.inner_mut()?;
        let written = port.write(data).context("serial write failed")?;
        Ok(written)
    }

    fn flush(&mut self) -> Result<()> {
        let port = self.inner_mut()?;
        port.flush().context("serial flush failed")?;
        Ok(())
    }

    fn set_rts(&mut self, asserted: bool) -> Result<()> {
        let port = self.inner_mut()?;
        port.write_request_to_send(asserted)
            .context("failed to toggle RTS")?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn SerialPort>> {
        let inner = match &self.inner {
            Some(port) => Some(
                port.try_clone()
                    .with_context(|| format!("failed to clone handle for {}", self.path))?,
            ),
            None => None,
        };
        Ok(Box::new(HardwarePort {
            path: self.path.clone(),
            baud: self.baud,
            inner,
        }))
    }
}
