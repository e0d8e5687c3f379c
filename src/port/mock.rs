//! Loopback device stub for testing
//!
//! An in-memory implementation of [`SerialPort`] that behaves like the far
//! end of the link: it reassembles COBS frames from host writes, validates
//! checksums, answers echo and status requests, and keeps the same error
//! counters the firmware reports. Tests drive the full transport stack
//! against it without hardware.
//!
//! All state lives behind an `Arc<Mutex<..>>`, so clones (including the
//! handle the reader worker takes) observe one shared device.

use crate::port::SerialPort;
use crate::protocol::{self, checksum::checksum, cobs};
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Device-side statistics slots (mirrors the firmware table).
const MSG_MALFORMED_ERROR: u8 = 6;
const COBS_DECODE_ERROR: u8 = 7;
const RECEIVE_BUFFER_OVERFLOW_ERROR: u8 = 8;
const CHECKSUM_ERROR: u8 = 9;
const UNKNOWN_CMD_ERROR: u8 = 11;

/// Device-side receive buffer bound.
const DEVICE_BUFFER_LIMIT: usize = 1024;

#[derive(Debug)]
struct DeviceState {
    open: bool,
    baud: u32,
    /// Bytes queued for the host to read.
    rx: VecDeque<u8>,
    /// Every byte the host wrote, in order.
    written: Vec<u8>,
    /// Device-side frame reassembly.
    frame_acc: Vec<u8>,
    echo_enabled: bool,
    respond_status: bool,
    fail_reads: bool,
    fail_writes: bool,
    rts_level: bool,
    rts_history: Vec<bool>,
    statistics: HashMap<u8, u32>,
    tasks: HashMap<u8, (u32, u32, u32)>,
}

impl DeviceState {
    fn bump(&mut self, index: u8) {
        *self.statistics.entry(index).or_insert(0) += 1;
    }
}

/// In-memory serial device that loops valid echo frames back to the host.
#[derive(Clone)]
pub struct LoopbackPort {
    state: Arc<Mutex<DeviceState>>,
}

impl LoopbackPort {
    /// Create a closed loopback device at `baud`.
    pub fn new(baud: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                open: false,
                baud,
                rx: VecDeque::new(),
                written: Vec::new(),
                frame_acc: Vec::new(),
                echo_enabled: true,
                respond_status: true,
                fail_reads: false,
                fail_writes: false,
                rts_level: true,
                rts_history: Vec::new(),
                statistics: HashMap::new(),
                tasks: HashMap::new(),
            })),
        }
    }

    /// Enable or disable echo responses (disabled = dropped echoes).
    pub fn set_echo_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().echo_enabled = enabled;
    }

    /// Enable or disable statistics/task status responses.
    pub fn set_respond_status(&self, enabled: bool) {
        self.state.lock().unwrap().respond_status = enabled;
    }

    /// Make subsequent reads fail with an I/O error (fatal-path testing).
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Seed a statistics slot the device will report.
    pub fn set_statistic(&self, index: u8, value: u32) {
        self.state.lock().unwrap().statistics.insert(index, value);
    }

    /// Current value of a device statistics slot.
    pub fn statistic(&self, index: u8) -> u32 {
        self.state
            .lock()
            .unwrap()
            .statistics
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    /// Seed a task accounting record the device will report.
    pub fn set_task(&self, index: u8, absolute_us: u32, percent: u32, high_watermark: u32) {
        self.state
            .lock()
            .unwrap()
            .tasks
            .insert(index, (absolute_us, percent, high_watermark));
    }

    /// Push device-initiated bytes into the host's receive path.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    /// Every byte the host has written so far.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    /// RTS transitions the host has driven, oldest first.
    pub fn rts_history(&self) -> Vec<bool> {
        self.state.lock().unwrap().rts_history.clone()
    }

    /// Current RTS level.
    pub fn rts_level(&self) -> bool {
        self.state.lock().unwrap().rts_level
    }

    fn respond(state: &mut DeviceState, payload: &[u8]) {
        let mut body = payload.to_vec();
        body.push(checksum(payload));
        state.rx.extend(cobs::encode(&body));
        state.rx.push_back(protocol::FRAME_DELIMITER);
    }

    fn dispatch(state: &mut DeviceState, decoded: &[u8]) {
        if decoded.len() < 3 || checksum(decoded) != 0 {
            let slot = if decoded.len() < 3 {
                MSG_MALFORMED_ERROR
            } else {
                CHECKSUM_ERROR
            };
            state.bump(slot);
            return;
        }
        let payload = &decoded[..decoded.len() - 1];
        let command = payload[1] & 0x1F;

        match protocol::Command::from_code(command) {
            Some(protocol::Command::Echo) => {
                if state.echo_enabled {
                    Self::respond(state, payload);
                }
            }
            Some(protocol::Command::StatisticsStatus) => {
                if state.respond_status {
                    if let Some(&index) = payload.get(3) {
                        let value = state.statistics.get(&index).copied().unwrap_or(0);
                        let mut response = vec![0x00, protocol::STATISTICS_HEADER[1], 0x05, index];
                        response.extend_from_slice(&value.to_be_bytes());
                        Self::respond(state, &response);
                    }
                }
            }
            Some(protocol::Command::TaskStatus) => {
                if state.respond_status {
                    if let Some(&index) = payload.get(3) {
                        let (abs, pct, hwm) = state.tasks.get(&index).copied().unwrap_or((0, 0, 0));
                        let mut response = vec![0x00, protocol::TASK_HEADER[1], 0x0D, index];
                        response.extend_from_slice(&abs.to_be_bytes());
                        response.extend_from_slice(&pct.to_be_bytes());
                        response.extend_from_slice(&hwm.to_be_bytes());
                        Self::respond(state, &response);
                    }
                }
            }
            _ => state.bump(UNKNOWN_CMD_ERROR),
        }
    }

    fn consume(state: &mut DeviceState, data: &[u8]) {
        for &byte in data {
            if byte == protocol::FRAME_DELIMITER {
                if state.frame_acc.is_empty() {
                    continue;
                }
                let frame = std::mem::take(&mut state.frame_acc);
                match cobs::decode(&frame) {
                    Ok(decoded) => Self::dispatch(state, &decoded),
                    Err(_) => state.bump(COBS_DECODE_ERROR),
                }
            } else {
                state.frame_acc.push(byte);
                if state.frame_acc.len() > DEVICE_BUFFER_LIMIT {
                    state.frame_acc.clear();
                    state.bump(RECEIVE_BUFFER_OVERFLOW_ERROR);
                }
            }
        }
    }
}

impl SerialPort for LoopbackPort {
    fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.open = true;
        state.rx.clear();
        state.frame_acc.clear();
        state.rts_level = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn baud_rate(&self) -> u32 {
        self.state.lock().unwrap().baud
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<()> {
        self.state.lock().unwrap().baud = rate;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        Ok(self.state.lock().unwrap().rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_reads {
                anyhow::bail!("loopback read failure injected");
            }
            if !state.open {
                anyhow::bail!("loopback port is not open");
            }
            let n = buf.len().min(state.rx.len());
            if n > 0 {
                for slot in buf.iter_mut().take(n) {
                    *slot = state.rx.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
        }
        // Model the hardware read timeout without spinning the reader.
        thread::sleep(Duration::from_millis(1));
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            anyhow::bail!("loopback write failure injected");
        }
        if !state.open {
            anyhow::bail!("loopback port is not open");
        }
        state.written.extend_from_slice(data);
        Self::consume(&mut state, data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, asserted: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.rts_level = asserted;
        state.rts_history.push(asserted);
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn SerialPort>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut body = payload.to_vec();
        body.push(checksum(payload));
        let mut wire = cobs::encode(&body);
        wire.push(protocol::FRAME_DELIMITER);
        wire
    }

    #[test]
    fn test_echoes_valid_echo_frame() {
        let mut port = LoopbackPort::new(115_200);
        port.open().unwrap();

        let wire = frame(&protocol::build_echo(7, 10));
        port.write(&wire).unwrap();

        let mut buf = vec![0u8; 64];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &wire[..]);
    }

    #[test]
    fn test_statistics_request_reports_seeded_value() {
        let mut port = LoopbackPort::new(115_200);
        port.open().unwrap();
        port.set_statistic(9, 42);

        let wire = frame(&protocol::build_status_request(protocol::STATISTICS_HEADER, 9));
        port.write(&wire).unwrap();

        let mut buf = vec![0u8; 64];
        let n = port.read(&mut buf).unwrap();
        let decoded = cobs::decode(&buf[..n - 1]).unwrap();
        assert_eq!(decoded[3], 9);
        assert_eq!(protocol::read_u32_be(&decoded, 4), Some(42));
    }

    #[test]
    fn test_garbage_counts_cobs_decode_error() {
        let mut port = LoopbackPort::new(115_200);
        port.open().unwrap();

        port.write(&[0x05, 0x11, 0x00]).unwrap();
        assert_eq!(port.statistic(COBS_DECODE_ERROR), 1);
    }

    #[test]
    fn test_bad_checksum_counts_checksum_error() {
        let mut port = LoopbackPort::new(115_200);
        port.open().unwrap();

        let payload = protocol::build_echo(1, 10);
        let mut body = payload.clone();
        body.push(checksum(&payload) ^ 0xFF);
        let mut wire = cobs::encode(&body);
        wire.push(protocol::FRAME_DELIMITER);

        port.write(&wire).unwrap();
        assert_eq!(port.statistic(CHECKSUM_ERROR), 1);
        // No response queued.
        assert_eq!(port.bytes_to_read().unwrap(), 0);
    }

    #[test]
    fn test_clone_shares_device() {
        let mut port = LoopbackPort::new(115_200);
        port.open().unwrap();
        let mut reader = match port.try_clone() {
            Ok(p) => p,
            Err(e) => panic!("clone failed: {e}"),
        };

        port.write(&frame(&protocol::build_echo(3, 6))).unwrap();
        let mut buf = vec![0u8; 64];
        assert!(reader.read(&mut buf).unwrap() > 0);
    }
}
