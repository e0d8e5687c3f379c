//! Baud sweep controller
//!
//! Runs a latency burst at each rate in a sweep list. Every rate change
//! replaces the transport workers, so the probe is re-bound after each
//! reconfigure and once more after the original rate is restored at the
//! end. Messages are paced by the minimum wire delay for the active rate.

use crate::config::DEFAULT_BAUD_RATES;
use crate::output::json;
use crate::probe::{Probe, STATUS_REQUEST_TIMEOUT};
use crate::runner::burst::{burst_record, run_paced_burst, BurstResult};
use crate::runner::{clamp_message_length, clamp_samples, min_drain_delay};
use crate::transport::Transport;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Settle time after a rate change before traffic resumes.
const STABILISATION_DELAY: Duration = Duration::from_millis(500);

/// Options for one sweep.
#[derive(Debug, Clone)]
pub struct BaudSweepOptions {
    pub baud_rates: Vec<u32>,
    /// Echo messages per rate.
    pub samples: usize,
    /// Settle time after each burst, seconds.
    pub wait_time: f64,
    /// Echo payload length (clamped to 6..=10).
    pub message_length: u8,
    /// Return to the original rate when the sweep ends.
    pub restore_baudrate: bool,
}

impl Default for BaudSweepOptions {
    fn default() -> Self {
        Self {
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            samples: 255,
            wait_time: 3.0,
            message_length: 10,
            restore_baudrate: true,
        }
    }
}

/// Sweep the configured rates and write the result array to
/// `<output_dir>/<stamp>_baud_sweep.json`.
pub fn run_baud_sweep(
    transport: &mut Transport,
    probe: &Arc<Probe>,
    output_dir: &Path,
    opts: &BaudSweepOptions,
) -> Result<(Vec<BurstResult>, PathBuf)> {
    let message_length = clamp_message_length(opts.message_length);
    let samples = clamp_samples(opts.samples);
    let original_baudrate = transport.baud_rate();

    let mut records = Vec::with_capacity(opts.baud_rates.len());
    for (test_id, &rate) in opts.baud_rates.iter().enumerate() {
        probe.clear_latency();
        let status_before = probe.request_snapshot(transport, STATUS_REQUEST_TIMEOUT);

        log::info!("sweep {test_id}: setting baud rate to {rate}");
        if !transport.set_baudrate(rate) {
            log::warn!("failed to set baud rate {rate}, skipping");
            continue;
        }
        // The reconfigure replaced the workers and their subscription.
        probe.bind(transport);
        thread::sleep(STABILISATION_DELAY);

        let min_uart_delay = min_drain_delay(message_length, rate);
        let (burst_elapsed, outstanding_series) =
            run_paced_burst(transport, probe, samples, message_length, || min_uart_delay);

        log::info!("waiting {:.1} s to collect late responses", opts.wait_time);
        thread::sleep(Duration::from_secs_f64(opts.wait_time));
        let status_after = probe.request_snapshot(transport, STATUS_REQUEST_TIMEOUT);

        records.push(burst_record(
            probe,
            test_id,
            min_uart_delay.as_secs_f64(),
            samples,
            false,
            burst_elapsed,
            message_length,
            Some(rate),
            outstanding_series,
            status_before,
            status_after,
        ));
    }

    if opts.restore_baudrate && transport.baud_rate() != original_baudrate {
        log::info!("restoring original baud rate {original_baudrate}");
        if transport.set_baudrate(original_baudrate) {
            probe.bind(transport);
        } else {
            log::error!("failed to restore baud rate {original_baudrate}");
        }
    }

    let path = json::write_baud_sweep_results(output_dir, &records)?;
    Ok((records, path))
}
