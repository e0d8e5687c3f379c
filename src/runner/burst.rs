//! Burst controller
//!
//! Runs paced echo bursts: each burst publishes `samples` counter-stamped
//! echoes with an inter-message wait, collects late responses, snapshots the
//! device status around the burst, and records one [`BurstResult`] per
//! burst. The wait interpolates linearly from `min_wait` to `max_wait`
//! across bursts and never drops below the UART drain floor for the current
//! baud rate.

use crate::output::json;
use crate::probe::status::{status_delta, StatusDelta, StatusSnapshot};
use crate::probe::{Probe, STATUS_REQUEST_TIMEOUT};
use crate::runner::{clamp_message_length, clamp_samples, min_drain_delay};
use crate::transport::Transport;
use crate::Result;
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Options for one burst run.
#[derive(Debug, Clone)]
pub struct BurstOptions {
    /// Number of bursts.
    pub num_times: usize,
    /// Inter-message wait for the first burst, seconds.
    pub min_wait: f64,
    /// Inter-message wait for the last burst, seconds.
    pub max_wait: f64,
    /// Settle time after each burst, seconds.
    pub wait_time: f64,
    /// Echo messages per burst.
    pub samples: usize,
    /// Echo payload length (clamped to 6..=10).
    pub message_length: u8,
    /// Add uniform random jitter to the inter-message wait.
    pub jitter: bool,
}

impl Default for BurstOptions {
    fn default() -> Self {
        Self {
            num_times: 10,
            min_wait: 0.0,
            max_wait: 0.7,
            wait_time: 3.0,
            samples: 255,
            message_length: 10,
            jitter: false,
        }
    }
}

/// Result record for one burst. Written once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct BurstResult {
    pub test_id: usize,
    /// Effective inter-message wait in seconds.
    pub waiting_time: f64,
    pub samples: usize,
    pub latency_avg: f64,
    pub latency_min: f64,
    pub latency_max: f64,
    pub latency_p95: f64,
    pub jitter: bool,
    /// Payload bits per second over the burst window.
    pub bitrate: f64,
    pub dropped: usize,
    /// Unmatched echo count sampled after every publish.
    pub outstanding_series: Vec<usize>,
    pub outstanding_max: usize,
    pub outstanding_final: usize,
    /// Set by the baud sweep controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baudrate: Option<u32>,
    pub status_before: StatusSnapshot,
    pub status_after: StatusSnapshot,
    pub status_delta: StatusDelta,
    /// Raw round-trip times in seconds.
    pub results: Vec<f64>,
}

/// Measure one paced burst that is already in flight bookkeeping-wise:
/// publishes `samples` echoes spaced by `wait_for` and samples the backlog.
/// Returns (elapsed seconds, outstanding series).
pub(crate) fn run_paced_burst(
    transport: &Transport,
    probe: &Arc<Probe>,
    samples: usize,
    message_length: u8,
    mut wait_for: impl FnMut() -> Duration,
) -> (f64, Vec<usize>) {
    let mut outstanding_series = Vec::with_capacity(samples);
    let start = Instant::now();
    for i in 0..samples {
        probe.publish(transport, i as u16, message_length);
        thread::sleep(wait_for());
        outstanding_series.push(probe.outstanding());
    }
    (start.elapsed().as_secs_f64(), outstanding_series)
}

/// Assemble a [`BurstResult`] from the probe's current burst state.
#[allow(clippy::too_many_arguments)]
pub(crate) fn burst_record(
    probe: &Arc<Probe>,
    test_id: usize,
    waiting_time: f64,
    samples: usize,
    jitter: bool,
    burst_elapsed: f64,
    message_length: u8,
    baudrate: Option<u32>,
    outstanding_series: Vec<usize>,
    status_before: StatusSnapshot,
    status_after: StatusSnapshot,
) -> BurstResult {
    let stats = probe.latency_stats();
    let results = probe.latencies();
    let dropped = probe.dropped();
    let outstanding_final = probe.outstanding();
    let outstanding_max = outstanding_series
        .iter()
        .copied()
        .chain(std::iter::once(outstanding_final))
        .max()
        .unwrap_or(0);
    let bitrate = if burst_elapsed > 0.0 {
        (samples * 8 * message_length as usize) as f64 / burst_elapsed
    } else {
        0.0
    };

    log::info!(
        "burst {test_id}: dropped {dropped}, avg {:.3} ms, min {:.3} ms, max {:.3} ms, p95 {:.3} ms, bitrate {:.0} bit/s",
        stats.avg * 1e3,
        stats.min * 1e3,
        stats.max * 1e3,
        stats.p95 * 1e3,
        bitrate,
    );

    let delta = status_delta(&status_before, &status_after);
    BurstResult {
        test_id,
        waiting_time,
        samples,
        latency_avg: stats.avg,
        latency_min: stats.min,
        latency_max: stats.max,
        latency_p95: stats.p95,
        jitter,
        bitrate,
        dropped,
        outstanding_series,
        outstanding_max,
        outstanding_final,
        baudrate,
        status_before,
        status_after,
        status_delta: delta,
        results,
    }
}

/// Run `opts.num_times` bursts and write the result array to
/// `<output_dir>/<stamp>_output.json`. Returns the records alongside the
/// artifact path.
pub fn run_burst(
    transport: &Transport,
    probe: &Arc<Probe>,
    output_dir: &Path,
    opts: &BurstOptions,
) -> Result<(Vec<BurstResult>, PathBuf)> {
    let message_length = clamp_message_length(opts.message_length);
    let samples = clamp_samples(opts.samples);
    let min_drain = min_drain_delay(message_length, transport.baud_rate()).as_secs_f64();
    let jitter_span = (opts.max_wait - opts.min_wait) * 0.2;

    let mut records = Vec::with_capacity(opts.num_times);
    for test_id in 0..opts.num_times {
        probe.clear_latency();
        let status_before = probe.request_snapshot(transport, STATUS_REQUEST_TIMEOUT);

        let raw_wait = if opts.num_times > 1 {
            opts.min_wait
                + (opts.max_wait - opts.min_wait) * test_id as f64 / (opts.num_times - 1) as f64
        } else {
            opts.min_wait
        };
        // The drain floor also catches negative waits from bad options.
        let waiting_time = raw_wait.max(min_drain);
        log::info!("burst {test_id}: waiting time {waiting_time:.4} s");

        let jitter = opts.jitter;
        let (burst_elapsed, outstanding_series) =
            run_paced_burst(transport, probe, samples, message_length, || {
                let extra = if jitter && jitter_span > 0.0 {
                    rand::thread_rng().gen_range(0.0..jitter_span)
                } else {
                    0.0
                };
                Duration::from_secs_f64(waiting_time + extra)
            });

        log::info!("waiting {:.1} s to collect late responses", opts.wait_time);
        thread::sleep(Duration::from_secs_f64(opts.wait_time.max(0.0)));
        let status_after = probe.request_snapshot(transport, STATUS_REQUEST_TIMEOUT);

        records.push(burst_record(
            probe,
            test_id,
            waiting_time,
            samples,
            opts.jitter,
            burst_elapsed,
            message_length,
            None,
            outstanding_series,
            status_before,
            status_after,
        ));
    }

    let path = json::write_burst_results(output_dir, &records)?;
    Ok((records, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;

    fn quick_opts() -> BurstOptions {
        BurstOptions {
            num_times: 1,
            min_wait: 0.0,
            max_wait: 0.0,
            wait_time: 0.05,
            samples: 5,
            message_length: 10,
            jitter: false,
        }
    }

    fn open_stack() -> (Transport, Arc<Probe>) {
        let device = LoopbackPort::new(115_200);
        let mut transport = Transport::new(Box::new(device));
        transport.open().unwrap();
        let probe = Probe::new();
        probe.bind(&transport);
        (transport, probe)
    }

    #[test]
    fn test_burst_roundtrip_records() {
        let (transport, probe) = open_stack();
        let dir = tempfile::tempdir().unwrap();

        let (records, path) = run_burst(&transport, &probe, dir.path(), &quick_opts()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.samples, 5);
        assert_eq!(record.dropped, 0);
        assert_eq!(record.results.len(), 5);
        assert!(record.latency_avg > 0.0);
        assert!(record.latency_min <= record.latency_p95);
        assert!(record.latency_p95 <= record.latency_max);
        assert!(record.bitrate > 0.0);
        assert_eq!(record.outstanding_final, 0);
        assert_eq!(record.outstanding_series.len(), 5);
        assert!(record.baudrate.is_none());
        assert!(record.status_before.complete);
        assert!(record.status_after.complete);
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with("_output.json"));
    }

    #[test]
    fn test_burst_with_unresponsive_device_reports_drops() {
        let device = LoopbackPort::new(115_200);
        device.set_echo_enabled(false);
        let mut transport = Transport::new(Box::new(device));
        transport.open().unwrap();
        let probe = Probe::new();
        probe.bind(&transport);
        let dir = tempfile::tempdir().unwrap();

        let (records, _) = run_burst(&transport, &probe, dir.path(), &quick_opts()).unwrap();
        let record = &records[0];
        assert_eq!(record.dropped, 5);
        assert_eq!(record.latency_avg, 0.0);
        assert_eq!(record.latency_p95, 0.0);
        assert_eq!(record.outstanding_final, 5);
        assert_eq!(record.outstanding_max, 5);
        assert!(record.results.is_empty());
    }

    #[test]
    fn test_zero_samples_yields_zero_record() {
        let (transport, probe) = open_stack();
        let dir = tempfile::tempdir().unwrap();
        let opts = BurstOptions {
            samples: 0,
            ..quick_opts()
        };

        let (records, _) = run_burst(&transport, &probe, dir.path(), &opts).unwrap();
        let record = &records[0];
        assert_eq!(record.samples, 0);
        assert_eq!(record.dropped, 0);
        assert_eq!(record.latency_avg, 0.0);
        assert!(record.outstanding_series.is_empty());
    }

    #[test]
    fn test_out_of_range_length_uses_default() {
        let (transport, probe) = open_stack();
        let dir = tempfile::tempdir().unwrap();
        let opts = BurstOptions {
            message_length: 5,
            ..quick_opts()
        };

        let (records, _) = run_burst(&transport, &probe, dir.path(), &opts).unwrap();
        // Bitrate is computed from the clamped default length.
        assert_eq!(records[0].dropped, 0);
        assert_eq!(records[0].results.len(), 5);
    }

    #[test]
    fn test_wait_interpolates_across_bursts() {
        let (transport, probe) = open_stack();
        let dir = tempfile::tempdir().unwrap();
        let opts = BurstOptions {
            num_times: 3,
            min_wait: 0.001,
            max_wait: 0.005,
            wait_time: 0.01,
            samples: 2,
            message_length: 10,
            jitter: false,
        };

        let (records, _) = run_burst(&transport, &probe, dir.path(), &opts).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].waiting_time < records[1].waiting_time);
        assert!(records[1].waiting_time < records[2].waiting_time);
        assert!((records[2].waiting_time - 0.005).abs() < 1e-9);
    }
}
