//! Framed serial transport
//!
//! This module owns the concurrent I/O pipeline between the serial port and
//! the message layer:
//!
//! - a **reader** worker pulls raw bytes off the port, feeds the
//!   [`Framer`](framer::Framer), drives the RTS watermarks, and queues
//!   completed frames
//! - a **processor** worker pops frames from a bounded FIFO, COBS-decodes
//!   them, counts the command, and dispatches to the registered message
//!   handler
//!
//! Both workers are gated by one stop signal and are replaced wholesale on
//! [`Transport::set_baudrate`], which is why the message handler has to be
//! re-registered after every reconfigure.
//!
//! Outbound, [`Transport::write`] appends the XOR checksum, COBS-encodes,
//! and terminates the packet with the `0x00` delimiter.

pub mod framer;
pub mod stats;

use crate::port::SerialPort;
use crate::protocol::{self, checksum::checksum, cobs};
use crate::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use framer::Framer;
use stats::TransportStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Inbound frame queue depth.
const QUEUE_CAPACITY: usize = 1024;
/// Processor pop timeout, bounds stop-signal latency.
const POP_TIMEOUT: Duration = Duration::from_millis(100);
/// Reader-side enqueue timeout before a frame is dropped.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
/// Largest single read the reader attempts.
const READ_CHUNK: usize = 4096;

/// Handler invoked by the processor with `(command, decoded, raw_frame)`.
///
/// `decoded` is the full COBS-decoded body including the trailing checksum
/// byte; `raw_frame` is the encoded frame as it arrived, delimiter stripped.
pub type MessageHandler = Arc<dyn Fn(u8, &[u8], &[u8]) + Send + Sync>;

struct Workers {
    reader: JoinHandle<()>,
    processor: JoinHandle<()>,
}

/// Serial transport: port ownership, worker pair, and the write path.
pub struct Transport {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    stats: Arc<TransportStats>,
    stop: Arc<AtomicBool>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    workers: Option<Workers>,
}

impl Transport {
    /// Wrap a port. The transport starts closed; call [`Transport::open`].
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port: Arc::new(Mutex::new(port)),
            stats: Arc::new(TransportStats::new()),
            stop: Arc::new(AtomicBool::new(true)),
            handler: Arc::new(Mutex::new(None)),
            workers: None,
        }
    }

    /// Open the port and start the reader/processor workers.
    pub fn open(&mut self) -> Result<()> {
        let reader_port = {
            let mut port = self.port.lock().unwrap();
            port.open()?;
            port.try_clone()?
        };

        self.stop.store(false, Ordering::SeqCst);
        let (tx, rx) = bounded::<Vec<u8>>(QUEUE_CAPACITY);

        let reader = {
            let stop = Arc::clone(&self.stop);
            let stats = Arc::clone(&self.stats);
            thread::Builder::new()
                .name("uartpulse-reader".into())
                .spawn(move || reader_loop(reader_port, tx, stop, stats))?
        };

        let processor = {
            let stop = Arc::clone(&self.stop);
            let stats = Arc::clone(&self.stats);
            let handler = Arc::clone(&self.handler);
            thread::Builder::new()
                .name("uartpulse-processor".into())
                .spawn(move || processor_loop(rx, stop, stats, handler))?
        };

        self.workers = Some(Workers { reader, processor });
        Ok(())
    }

    /// Stop the workers and close the port. Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(workers) = self.workers.take() {
            let _ = workers.reader.join();
            let _ = workers.processor.join();
        }
        self.port.lock().unwrap().close();
    }

    /// Whether the port is open and the pipeline has not hit a fatal error.
    pub fn is_open(&self) -> bool {
        !self.stop.load(Ordering::SeqCst) && self.port.lock().unwrap().is_open()
    }

    /// Currently configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.port.lock().unwrap().baud_rate()
    }

    /// Transport counters shared with the workers.
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Register the message handler the processor dispatches to.
    ///
    /// The registration does not survive [`Transport::set_baudrate`]; the
    /// caller re-binds after every reconfigure.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Frame and send one payload.
    ///
    /// Silently ignored when the pipeline is stopped or the port is closed;
    /// the packet is `COBS(payload || checksum) || 0x00`.
    pub fn write(&self, payload: &[u8]) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut port = self.port.lock().unwrap();
        if !port.is_open() {
            return;
        }

        let mut body = Vec::with_capacity(payload.len() + 1);
        body.extend_from_slice(payload);
        body.push(checksum(payload));
        let mut frame = cobs::encode(&body);
        frame.push(protocol::FRAME_DELIMITER);

        match port.write(&frame) {
            Ok(written) => self.stats.record_bytes_sent(written as u64),
            Err(e) => {
                log::warn!("serial write failed: {e:#}");
                return;
            }
        }

        match payload.get(1) {
            Some(&cmd_byte) => self.stats.record_command_sent(cmd_byte & 0x1F),
            None => log::warn!("published payload shorter than 2 bytes, command not counted"),
        }
    }

    /// Write raw bytes straight to the port, bypassing checksum and framing.
    ///
    /// Used for fault injection; the bytes do not count as a command.
    pub fn write_raw(&self, bytes: &[u8]) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut port = self.port.lock().unwrap();
        if !port.is_open() {
            return;
        }
        if let Err(e) = port.write(bytes) {
            log::warn!("raw serial write failed: {e:#}");
        }
        let _ = port.flush();
    }

    /// Block until the transmit buffer has drained.
    pub fn flush(&self) {
        if let Err(e) = self.port.lock().unwrap().flush() {
            log::debug!("serial flush failed: {e:#}");
        }
    }

    /// Reconfigure the baud rate.
    ///
    /// Shuts both workers down, closes and reopens the port at the new rate,
    /// and restarts the workers. Worker replacement loses any registered
    /// message handler, so the caller must re-bind it afterwards. Returns
    /// `false` (with the port closed) when the reopen fails.
    pub fn set_baudrate(&mut self, rate: u32) -> bool {
        self.close();
        *self.handler.lock().unwrap() = None;

        if let Err(e) = self.port.lock().unwrap().set_baud_rate(rate) {
            log::error!("failed to set baud rate {rate}: {e:#}");
            return false;
        }
        match self.open() {
            Ok(()) => {
                log::info!("reconfigured serial link to {rate} baud");
                true
            }
            Err(e) => {
                log::error!("failed to reopen port at {rate} baud: {e:#}");
                false
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader worker: port bytes in, framed byte strings out.
fn reader_loop(
    mut port: Box<dyn SerialPort>,
    tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
) {
    log::debug!("reader worker started");
    let mut framer = Framer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut frames: Vec<Vec<u8>> = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        // Read whatever the port reports as pending, else block for one byte.
        let pending = port.bytes_to_read().unwrap_or(0);
        let want = pending.clamp(1, READ_CHUNK);
        match port.read(&mut buf[..want]) {
            Ok(0) => continue,
            Ok(n) => {
                stats.record_bytes_received(n as u64);
                let rts_change = framer.push_chunk(&buf[..n], &mut frames);
                if let Some(level) = rts_change {
                    if let Err(e) = port.set_rts(level) {
                        log::debug!("RTS toggle failed: {e:#}");
                    }
                }
                for frame in frames.drain(..) {
                    if tx.send_timeout(frame, ENQUEUE_TIMEOUT).is_err() {
                        log::warn!("inbound frame queue full, dropping frame");
                    }
                }
            }
            Err(e) => {
                log::error!("fatal serial read error: {e:#}");
                stop.store(true, Ordering::SeqCst);
                port.close();
                break;
            }
        }
    }
    log::debug!("reader worker stopped");
}

/// Processor worker: frames in, decoded handler dispatches out.
fn processor_loop(
    rx: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
) {
    log::debug!("processor worker started");
    loop {
        match rx.recv_timeout(POP_TIMEOUT) {
            Ok(frame) => process_frame(&frame, &stats, &handler),
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("processor worker stopped");
}

fn process_frame(
    frame: &[u8],
    stats: &TransportStats,
    handler: &Mutex<Option<MessageHandler>>,
) {
    let decoded = match cobs::decode(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::warn!("dropping undecodable frame ({} bytes): {e}", frame.len());
            return;
        }
    };
    let command = match protocol::command_code(&decoded) {
        Some(command) => command,
        None => {
            log::warn!("dropping short frame ({} bytes decoded)", decoded.len());
            return;
        }
    };
    stats.record_command_received(command);

    let handler = handler.lock().unwrap().clone();
    if let Some(handler) = handler {
        handler(command, &decoded, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;
    use std::time::Instant;

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn open_transport() -> (Transport, LoopbackPort) {
        let device = LoopbackPort::new(115_200);
        let mut transport = Transport::new(Box::new(device.clone()));
        transport.open().unwrap();
        (transport, device)
    }

    #[test]
    fn test_write_frames_payload() {
        let (transport, device) = open_transport();
        let payload = protocol::build_echo(7, 10);
        transport.write(&payload);

        let mut expected = payload.clone();
        expected.push(checksum(&payload));
        let mut wire = cobs::encode(&expected);
        wire.push(0x00);

        assert_eq!(device.written_bytes(), wire);
        assert_eq!(transport.stats().bytes_sent(), wire.len() as u64);
        assert_eq!(transport.stats().commands_sent(20), 1);
    }

    #[test]
    fn test_write_when_closed_is_silent() {
        let device = LoopbackPort::new(115_200);
        let transport = Transport::new(Box::new(device.clone()));
        transport.write(&protocol::build_echo(1, 10));
        assert!(device.written_bytes().is_empty());
        assert_eq!(transport.stats().bytes_sent(), 0);
    }

    #[test]
    fn test_short_payload_counts_bytes_but_no_command() {
        let (transport, _device) = open_transport();
        transport.write(&[0x42]);
        assert!(transport.stats().bytes_sent() > 0);
        for code in 0..32u8 {
            assert_eq!(transport.stats().commands_sent(code), 0);
        }
    }

    #[test]
    fn test_echo_roundtrip_dispatches_handler() {
        let (transport, _device) = open_transport();
        let seen: Arc<Mutex<Vec<(u8, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.set_message_handler(Arc::new(move |command, decoded, _raw| {
            sink.lock().unwrap().push((command, decoded.to_vec()));
        }));

        transport.write(&protocol::build_echo(7, 10));

        assert!(wait_until(
            || !seen.lock().unwrap().is_empty(),
            Duration::from_secs(1)
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, 20);
        assert_eq!(protocol::read_u16_be(&seen[0].1, 3), Some(7));
        assert_eq!(transport.stats().commands_received(20), 1);
    }

    #[test]
    fn test_processor_survives_protocol_noise() {
        let (transport, device) = open_transport();
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.set_message_handler(Arc::new(move |command, _decoded, _raw| {
            sink.lock().unwrap().push(command);
        }));

        // Undecodable frame, then a 1-byte frame, then a valid echo.
        device.inject(&[0x05, 0x11, 0x22, 0x00]);
        device.inject(&[0x02, 0x41, 0x00]);
        transport.write(&protocol::build_echo(3, 10));

        assert!(wait_until(
            || seen.lock().unwrap().contains(&20),
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn test_fatal_read_error_stops_pipeline() {
        let (transport, device) = open_transport();
        device.set_fail_reads(true);
        assert!(wait_until(|| !transport.is_open(), Duration::from_secs(1)));
        // Writes after the failure are silently ignored.
        let before = device.written_bytes().len();
        transport.write(&protocol::build_echo(1, 10));
        assert_eq!(device.written_bytes().len(), before);
    }

    #[test]
    fn test_set_baudrate_replaces_workers_and_drops_handler() {
        let (mut transport, _device) = open_transport();
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |command, _decoded, _raw| {
            sink.lock().unwrap().push(command);
        });
        transport.set_message_handler(Arc::clone(&handler));

        assert!(transport.set_baudrate(9600));
        assert_eq!(transport.baud_rate(), 9600);
        assert!(transport.is_open());

        // The old subscription is gone after the reconfigure.
        transport.write(&protocol::build_echo(1, 10));
        thread::sleep(Duration::from_millis(100));
        assert!(seen.lock().unwrap().is_empty());

        // Re-binding restores dispatch.
        transport.set_message_handler(handler);
        transport.write(&protocol::build_echo(2, 10));
        assert!(wait_until(
            || !seen.lock().unwrap().is_empty(),
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut transport, _device) = open_transport();
        transport.close();
        transport.close();
        assert!(!transport.is_open());
    }

    #[test]
    fn test_rts_backpressure_end_to_end() {
        let (_transport, device) = open_transport();

        // One oversized chunk pushes the backlog past the high watermark.
        device.inject(&vec![0x01u8; 600]);
        assert!(wait_until(
            || device.rts_history().contains(&false),
            Duration::from_secs(1)
        ));

        // Drain the accumulator, then a small chunk falls below the low
        // watermark and the line comes back up.
        device.inject(&[0x00]);
        thread::sleep(Duration::from_millis(50));
        device.inject(&[0x01, 0x00]);
        assert!(wait_until(|| device.rts_level(), Duration::from_secs(1)));
    }

    #[test]
    fn test_bytes_received_counts_raw_chunks() {
        let (transport, device) = open_transport();
        // Consecutive delimiters carry no frame but still count as bytes.
        device.inject(&[0x00, 0x00, 0x00]);
        assert!(wait_until(
            || transport.stats().bytes_received() >= 3,
            Duration::from_secs(1)
        ));
        assert_eq!(transport.stats().commands_received(20), 0);
    }
}
