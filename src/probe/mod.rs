//! Round-trip latency meter and status probe
//!
//! The [`Probe`] stamps outbound echo messages with a 16-bit counter,
//! correlates returning echoes by that counter, and feeds statistics and
//! task status responses into the [`StatusTable`](status::StatusTable). It
//! is the single message handler every controller binds to the transport.
//!
//! Counter bookkeeping uses dense 65 536-entry tables indexed by the
//! counter itself: one send-time slot and one latency slot per counter, so
//! correlation is an array lookup and a stale response is a `None` check.

pub mod status;

use crate::protocol::{self, read_u16_be, read_u32_be};
use crate::transport::{MessageHandler, Transport};
use serde::Serialize;
use status::{StatusSnapshot, StatusTable, TaskRecord};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// One slot per possible 16-bit counter.
const COUNTER_SLOTS: usize = 1 << 16;

/// Gap between consecutive status request frames.
pub const STATUS_REQUEST_SPACING: Duration = Duration::from_millis(20);
/// Total wall-clock timeout for one snapshot.
pub const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Poll interval while waiting for snapshot responses.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Send/receive bookkeeping for one burst of counter-stamped echoes.
struct EchoTracker {
    sent_at: Box<[Option<Instant>]>,
    latency: Box<[Option<f64>]>,
    sent_count: usize,
    received_count: usize,
}

impl EchoTracker {
    fn new() -> Self {
        Self {
            sent_at: vec![None; COUNTER_SLOTS].into_boxed_slice(),
            latency: vec![None; COUNTER_SLOTS].into_boxed_slice(),
            sent_count: 0,
            received_count: 0,
        }
    }

    fn clear(&mut self) {
        self.sent_at.fill(None);
        self.latency.fill(None);
        self.sent_count = 0;
        self.received_count = 0;
    }

    fn record_sent(&mut self, counter: u16, at: Instant) {
        let slot = &mut self.sent_at[counter as usize];
        if slot.is_none() {
            self.sent_count += 1;
        }
        *slot = Some(at);
    }

    /// Complete a round trip; `false` when the counter was never sent
    /// (stale response after a clear) or already completed.
    fn record_received(&mut self, counter: u16, now: Instant) -> bool {
        let Some(sent_at) = self.sent_at[counter as usize] else {
            return false;
        };
        let slot = &mut self.latency[counter as usize];
        if slot.is_none() {
            self.received_count += 1;
        }
        *slot = Some(now.duration_since(sent_at).as_secs_f64());
        true
    }

    fn latencies(&self) -> Vec<f64> {
        self.latency.iter().filter_map(|slot| *slot).collect()
    }
}

/// Per-burst latency statistics in seconds.
///
/// All zero when no echo came back; the drop count is reported separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

impl LatencyStats {
    pub fn from_latencies(latencies: &[f64]) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }
        let sum: f64 = latencies.iter().sum();
        let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
        let max = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            avg: sum / latencies.len() as f64,
            min,
            max,
            p95: percentile(latencies, 95.0),
        }
    }
}

/// Linear-interpolation percentile over raw samples.
///
/// Rank `k = (n - 1) * pct / 100`, interpolated between the neighbouring
/// order statistics. Empty input yields 0.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let k = (sorted.len() - 1) as f64 * pct / 100.0;
    let lo = k.floor() as usize;
    let hi = k.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] * (hi as f64 - k) + sorted[hi] * (k - lo as f64)
    }
}

/// Latency meter plus status tables, bound to the transport as its message
/// handler.
pub struct Probe {
    echoes: Mutex<EchoTracker>,
    status: StatusTable,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            echoes: Mutex::new(EchoTracker::new()),
            status: StatusTable::new(),
        })
    }

    /// Build the transport-facing handler closure for this probe.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let probe = Arc::clone(self);
        Arc::new(move |command, decoded, _raw| probe.handle_message(command, decoded))
    }

    /// Register this probe as the transport's message handler.
    ///
    /// Must be repeated after every `set_baudrate`, which drops the
    /// registration along with the workers.
    pub fn bind(self: &Arc<Self>, transport: &Transport) {
        transport.set_message_handler(self.handler());
    }

    /// Send one counter-stamped echo and stamp its departure time.
    ///
    /// `message_length` must already be clamped to the valid 6..=10 range.
    /// The flush after the write keeps transmit buffering out of the
    /// measured round trip.
    pub fn publish(&self, transport: &Transport, counter: u16, message_length: u8) {
        let payload = protocol::build_echo(counter, message_length);
        self.echoes
            .lock()
            .unwrap()
            .record_sent(counter, Instant::now());
        transport.write(&payload);
        transport.flush();
        log::debug!("published echo counter={counter} length={message_length}");
    }

    /// Dispatch one decoded inbound message.
    pub fn handle_message(&self, command: u8, decoded: &[u8]) {
        match protocol::Command::from_code(command) {
            Some(protocol::Command::Echo) => self.handle_echo(decoded),
            Some(protocol::Command::StatisticsStatus) => self.handle_statistics(decoded),
            Some(protocol::Command::TaskStatus) => self.handle_task(decoded),
            _ => log::debug!("ignoring command {command}"),
        }
    }

    fn handle_echo(&self, decoded: &[u8]) {
        let Some(counter) = read_u16_be(decoded, 3) else {
            log::info!("invalid echo message ({} bytes)", decoded.len());
            return;
        };
        let mut echoes = self.echoes.lock().unwrap();
        if echoes.record_received(counter, Instant::now()) {
            if let Some(latency) = echoes.latency[counter as usize] {
                log::debug!("echo counter={counter} latency={:.5} ms", latency * 1e3);
            }
        } else {
            log::debug!("ignoring stale echo response counter={counter}");
        }
    }

    fn handle_statistics(&self, decoded: &[u8]) {
        let (Some(&index), Some(value)) = (decoded.get(3), read_u32_be(decoded, 4)) else {
            log::info!("invalid statistics status message ({} bytes)", decoded.len());
            return;
        };
        self.status.record_statistic(index, value);
    }

    fn handle_task(&self, decoded: &[u8]) {
        let (Some(&index), Some(abs), Some(pct), Some(hwm)) = (
            decoded.get(3),
            read_u32_be(decoded, 4),
            read_u32_be(decoded, 8),
            read_u32_be(decoded, 12),
        ) else {
            log::info!("invalid task status message ({} bytes)", decoded.len());
            return;
        };
        self.status.record_task(
            index,
            TaskRecord {
                absolute_time_us: abs,
                percent_time: pct,
                high_watermark: hwm,
            },
        );
    }

    /// Forget all sent/received echo state (start of a burst).
    pub fn clear_latency(&self) {
        self.echoes.lock().unwrap().clear();
    }

    pub fn sent_count(&self) -> usize {
        self.echoes.lock().unwrap().sent_count
    }

    pub fn received_count(&self) -> usize {
        self.echoes.lock().unwrap().received_count
    }

    /// Echoes sent but not yet matched.
    pub fn outstanding(&self) -> usize {
        let echoes = self.echoes.lock().unwrap();
        echoes.sent_count - echoes.received_count
    }

    /// Sent minus received; never negative because received ⊆ sent.
    pub fn dropped(&self) -> usize {
        self.outstanding()
    }

    /// Round-trip times recorded so far, in seconds, counter order.
    pub fn latencies(&self) -> Vec<f64> {
        self.echoes.lock().unwrap().latencies()
    }

    pub fn latency_stats(&self) -> LatencyStats {
        LatencyStats::from_latencies(&self.latencies())
    }

    /// Broadcast status requests for every slot and wait for the answers.
    ///
    /// Requests are spaced by [`STATUS_REQUEST_SPACING`] to avoid flooding
    /// the device queue; the wait ends when every slot has answered or
    /// `timeout` past the snapshot marker, whichever comes first.
    pub fn request_snapshot(&self, transport: &Transport, timeout: Duration) -> StatusSnapshot {
        if !transport.is_open() {
            return StatusSnapshot::empty();
        }

        let marker = Instant::now();
        for index in 0..status::STATISTICS_SLOTS.len() {
            transport.write(&protocol::build_status_request(
                protocol::STATISTICS_HEADER,
                index as u8,
            ));
            thread::sleep(STATUS_REQUEST_SPACING);
        }
        for index in 0..status::TASK_SLOTS.len() {
            transport.write(&protocol::build_status_request(
                protocol::TASK_HEADER,
                index as u8,
            ));
            thread::sleep(STATUS_REQUEST_SPACING);
        }

        let deadline = marker + timeout;
        while Instant::now() < deadline {
            let (statistics, tasks) = self.status.counts_since(marker);
            if statistics == status::STATISTICS_SLOTS.len() && tasks == status::TASK_SLOTS.len() {
                break;
            }
            thread::sleep(STATUS_POLL_INTERVAL);
        }

        let snapshot = self.status.snapshot(marker);
        if !snapshot.complete {
            log::warn!(
                "status snapshot incomplete: {}/{} statistics, {}/{} tasks",
                snapshot.received_statistics,
                status::STATISTICS_SLOTS.len(),
                snapshot.received_tasks,
                status::TASK_SLOTS.len()
            );
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;
    use crate::transport::Transport;

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

    #[test]
    fn test_echo_roundtrip_through_loopback() {
        let device = LoopbackPort::new(115_200);
        let mut transport = Transport::new(Box::new(device.clone()));
        transport.open().unwrap();
        let probe = Probe::new();
        probe.bind(&transport);

        for counter in 0..5 {
            probe.publish(&transport, counter, 10);
        }

        assert!(wait_until(
            || probe.received_count() == 5,
            Duration::from_secs(1)
        ));
        assert_eq!(probe.sent_count(), 5);
        assert_eq!(probe.dropped(), 0);
        assert!(probe.latencies().iter().all(|&l| l >= 0.0));
    }

    #[test]
    fn test_stale_echo_is_discarded() {
        let probe = Probe::new();
        // Echo response for a counter that was never sent.
        let mut decoded = protocol::build_echo(42, 10);
        decoded.push(0x00);
        probe.handle_message(20, &decoded);
        assert_eq!(probe.received_count(), 0);
        assert_eq!(probe.sent_count(), 0);
    }

    #[test]
    fn test_short_echo_is_discarded() {
        let probe = Probe::new();
        probe.handle_message(20, &[0x00, 0x34, 0x07]);
        assert_eq!(probe.received_count(), 0);
    }

    #[test]
    fn test_unknown_command_ignored() {
        let probe = Probe::new();
        probe.handle_message(31, &[0x00, 0x3F, 0x00, 0xAA]);
        assert_eq!(probe.received_count(), 0);
    }

    #[test]
    fn test_statistics_response_updates_table() {
        let probe = Probe::new();
        let marker = Instant::now();
        let mut decoded = vec![0x00, 0x37, 0x05, 0x07];
        decoded.extend_from_slice(&12u32.to_be_bytes());
        decoded.push(0x00);
        probe.handle_message(23, &decoded);

        let snapshot = probe.status.snapshot(marker);
        assert_eq!(snapshot.statistics["cobs_decode_error"], 12);
        assert_eq!(snapshot.received_statistics, 1);
    }

    #[test]
    fn test_task_response_updates_table() {
        let probe = Probe::new();
        let marker = Instant::now();
        let mut decoded = vec![0x00, 0x38, 0x0D, 0x02];
        decoded.extend_from_slice(&1000u32.to_be_bytes());
        decoded.extend_from_slice(&25u32.to_be_bytes());
        decoded.extend_from_slice(&128u32.to_be_bytes());
        decoded.push(0x00);
        probe.handle_message(24, &decoded);

        let snapshot = probe.status.snapshot(marker);
        let task = snapshot.tasks["uart_event_task"];
        assert_eq!(task.absolute_time_us, 1000);
        assert_eq!(task.percent_time, 25);
        assert_eq!(task.high_watermark, 128);
    }

    #[test]
    fn test_clear_makes_responses_stale() {
        let device = LoopbackPort::new(115_200);
        device.set_echo_enabled(false);
        let mut transport = Transport::new(Box::new(device.clone()));
        transport.open().unwrap();
        let probe = Probe::new();
        probe.bind(&transport);

        probe.publish(&transport, 3, 10);
        assert_eq!(probe.sent_count(), 1);
        probe.clear_latency();
        assert_eq!(probe.sent_count(), 0);

        // A response arriving after the clear must be ignored.
        let mut decoded = protocol::build_echo(3, 10);
        decoded.push(0x00);
        probe.handle_message(20, &decoded);
        assert_eq!(probe.received_count(), 0);
    }

    #[test]
    fn test_latency_stats_empty() {
        let stats = LatencyStats::from_latencies(&[]);
        assert_eq!(stats, LatencyStats::default());
    }

    #[test]
    fn test_latency_stats_single_sample() {
        let stats = LatencyStats::from_latencies(&[0.004]);
        assert_eq!(stats.avg, 0.004);
        assert_eq!(stats.min, 0.004);
        assert_eq!(stats.max, 0.004);
        assert_eq!(stats.p95, 0.004);
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let values = [1.0, 2.0, 3.0, 4.0];
        // k = 2.85 -> 3.0 * 0.15 + 4.0 * 0.85
        assert!((percentile(&values, 95.0) - 3.85).abs() < 1e-9);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn test_request_snapshot_with_loopback_completes() {
        let device = LoopbackPort::new(115_200);
        device.set_statistic(9, 7);
        device.set_task(0, 500, 10, 32);
        let mut transport = Transport::new(Box::new(device.clone()));
        transport.open().unwrap();
        let probe = Probe::new();
        probe.bind(&transport);

        let snapshot = probe.request_snapshot(&transport, STATUS_REQUEST_TIMEOUT);
        assert!(snapshot.complete);
        assert_eq!(snapshot.statistics["checksum_error"], 7);
        assert_eq!(snapshot.tasks["cdc_task"].absolute_time_us, 500);
    }

    #[test]
    fn test_request_snapshot_times_out_incomplete_on_silent_device() {
        let device = LoopbackPort::new(115_200);
        device.set_respond_status(false);
        let mut transport = Transport::new(Box::new(device));
        transport.open().unwrap();
        let probe = Probe::new();
        probe.bind(&transport);

        let snapshot = probe.request_snapshot(&transport, Duration::from_millis(200));
        assert!(!snapshot.complete);
        assert_eq!(snapshot.received_statistics, 0);
        assert_eq!(snapshot.received_tasks, 0);
        // The last known values are still reported.
        assert_eq!(snapshot.statistics.len(), status::STATISTICS_SLOTS.len());
    }

    #[test]
    fn test_request_snapshot_closed_port_is_empty() {
        let device = LoopbackPort::new(115_200);
        let transport = Transport::new(Box::new(device));
        let probe = Probe::new();
        let snapshot = probe.request_snapshot(&transport, Duration::from_millis(50));
        assert!(!snapshot.complete);
        assert_eq!(snapshot.received_statistics, 0);
    }
}
