//! Stress runner
//!
//! Executes the configured stress scenarios against the device and produces
//! an aggregated [`StressRunResult`] with a per-scenario verdict. Scenario
//! implementations compose the probe primitives: paced echo publishes,
//! status request cycles, baud reconfigures, and raw noise injection.

use crate::config::{CommandProfile, ScenarioConfig, StressConfig};
use crate::output::json;
use crate::output::summary::print_summary;
use crate::probe::status::{status_delta, StatusSnapshot, TaskRecord};
use crate::probe::{Probe, STATUS_REQUEST_TIMEOUT};
use crate::protocol;
use crate::runner::clamp_message_length;
use crate::runner::verdict::{
    aggregate_verdict, compute_latency_stats, evaluate_verdict, ScenarioResult, StressRunResult,
};
use crate::transport::Transport;
use crate::Result;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Mixed-profile command weights: 70% echo, 20% statistics, 10% task.
const MIXED_ECHO_WEIGHT: f64 = 0.70;
const MIXED_STATISTICS_WEIGHT: f64 = 0.20;

/// Minimum inter-command gap so zero pacing cannot flood the device queue.
const MIN_GAP: Duration = Duration::from_millis(1);

/// Stabilisation pause after a baud flip.
const FLIP_SETTLE: Duration = Duration::from_millis(200);

/// Pause between noise injection and the recovery echoes.
const NOISE_SETTLE: Duration = Duration::from_millis(100);

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Orchestrates one stress run over a shared transport/probe pair.
pub struct StressRunner<'a> {
    transport: &'a mut Transport,
    probe: Arc<Probe>,
    config: StressConfig,
    port_name: String,
    run_id: String,
}

impl<'a> StressRunner<'a> {
    pub fn new(
        transport: &'a mut Transport,
        probe: Arc<Probe>,
        config: StressConfig,
        port_name: impl Into<String>,
    ) -> Self {
        let run_id = format!(
            "{}-{:08x}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            rand::random::<u32>()
        );
        Self {
            transport,
            probe,
            config,
            port_name: port_name.into(),
            run_id,
        }
    }

    /// Run the selected scenarios, write the JSON report, and print the
    /// console summary. `scenario_filter` limits the run to one named
    /// scenario.
    pub fn execute(&mut self, scenario_filter: Option<&str>) -> Result<StressRunResult> {
        if !self.transport.is_open() {
            anyhow::bail!("no serial port available");
        }

        let selected: Vec<ScenarioConfig> = match scenario_filter {
            Some(name) => {
                let scenario = self
                    .config
                    .scenarios
                    .iter()
                    .find(|s| s.name == name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("unknown scenario '{name}'"))?;
                vec![scenario]
            }
            None => self.config.scenarios.clone(),
        };

        let started_at = now_iso();
        log::info!(
            "starting stress run {} with {} scenario(s)",
            self.run_id,
            selected.len()
        );

        let mut scenario_results = Vec::with_capacity(selected.len());
        for cfg in &selected {
            log::info!("=== scenario: {} ===", cfg.name);
            let result = self.run_scenario(cfg);
            log::info!("scenario '{}' finished: verdict={}", cfg.name, result.verdict);
            scenario_results.push(result);
        }

        let run_result = StressRunResult {
            run_id: self.run_id.clone(),
            port: self.port_name.clone(),
            baudrate: self.transport.baud_rate(),
            started_at,
            ended_at: now_iso(),
            overall_verdict: aggregate_verdict(&scenario_results),
            scenarios: scenario_results,
        };

        let report_path =
            json::write_stress_report(&self.config.output_dir, &run_result.run_id, &run_result)?;
        log::info!("stress report: {}", report_path.display());
        print_summary(&run_result);
        Ok(run_result)
    }

    fn run_scenario(&mut self, cfg: &ScenarioConfig) -> ScenarioResult {
        match cfg.command_profile {
            CommandProfile::EchoOnly => self.run_echo_burst(cfg),
            CommandProfile::Mixed => self.run_mixed_burst(cfg),
            CommandProfile::StatusPoll => self.run_status_poll_storm(cfg),
            CommandProfile::BaudFlip => self.run_baud_flip(cfg),
            CommandProfile::NoiseAndRecovery => self.run_noise_and_recovery(cfg),
        }
    }

    /// Send `num_messages` echoes with the configured pacing.
    fn run_echo_burst(&mut self, cfg: &ScenarioConfig) -> ScenarioResult {
        let started_at = now_iso();
        let length = clamp_message_length(cfg.message_length);
        self.probe.clear_latency();
        let pre = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);

        let gap = Duration::from_secs_f64(cfg.pacing_s.max(0.0)).max(MIN_GAP);
        for i in 0..cfg.num_messages {
            self.probe.publish(self.transport, i as u16, length);
            thread::sleep(gap);
        }

        thread::sleep(settle_after(cfg.pacing_s));
        let post = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);

        self.make_result(
            cfg,
            started_at,
            self.probe.sent_count(),
            self.probe.received_count(),
            latencies_ms(&self.probe),
            &pre,
            &post,
        )
    }

    /// Interleave echo, statistics, and task requests with weighted choice.
    /// Only echoes count as sent messages for drop accounting.
    fn run_mixed_burst(&mut self, cfg: &ScenarioConfig) -> ScenarioResult {
        let started_at = now_iso();
        let length = clamp_message_length(cfg.message_length);
        self.probe.clear_latency();
        let pre = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);

        let gap = Duration::from_secs_f64(cfg.pacing_s.max(0.0)).max(MIN_GAP);
        let mut echo_counter: u16 = 0;
        let mut rng = rand::thread_rng();
        for i in 0..cfg.num_messages {
            let roll: f64 = rng.gen();
            if roll < MIXED_ECHO_WEIGHT {
                self.probe.publish(self.transport, echo_counter, length);
                echo_counter = echo_counter.wrapping_add(1);
            } else if roll < MIXED_ECHO_WEIGHT + MIXED_STATISTICS_WEIGHT {
                let index = (i % crate::probe::status::STATISTICS_SLOTS.len()) as u8;
                self.transport.write(&protocol::build_status_request(
                    protocol::STATISTICS_HEADER,
                    index,
                ));
            } else {
                let index = (i % crate::probe::status::TASK_SLOTS.len()) as u8;
                self.transport
                    .write(&protocol::build_status_request(protocol::TASK_HEADER, index));
            }
            thread::sleep(gap);
        }

        thread::sleep(settle_after(cfg.pacing_s));
        let post = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);

        self.make_result(
            cfg,
            started_at,
            self.probe.sent_count(),
            self.probe.received_count(),
            latencies_ms(&self.probe),
            &pre,
            &post,
        )
    }

    /// Fire status requests for every slot, cycling until `duration_s`
    /// elapses. No echoes, so latency is not meaningful.
    fn run_status_poll_storm(&mut self, cfg: &ScenarioConfig) -> ScenarioResult {
        let started_at = now_iso();
        let pre = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);

        let deadline = Instant::now() + Duration::from_secs_f64(cfg.duration_s.max(0.0));
        let pacing = Duration::from_secs_f64(cfg.pacing_s.max(0.0));
        let mut requests_sent = 0usize;
        'storm: while Instant::now() < deadline {
            for index in 0..crate::probe::status::STATISTICS_SLOTS.len() {
                self.transport.write(&protocol::build_status_request(
                    protocol::STATISTICS_HEADER,
                    index as u8,
                ));
                requests_sent += 1;
                if cfg.pacing_s > 0.0 {
                    thread::sleep(pacing);
                }
                if Instant::now() >= deadline {
                    break 'storm;
                }
            }
            for index in 0..crate::probe::status::TASK_SLOTS.len() {
                self.transport
                    .write(&protocol::build_status_request(
                        protocol::TASK_HEADER,
                        index as u8,
                    ));
                requests_sent += 1;
                if cfg.pacing_s > 0.0 {
                    thread::sleep(pacing);
                }
                if Instant::now() >= deadline {
                    break 'storm;
                }
            }
        }

        let post = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);
        // Every request is its own round trip; drop accounting is not
        // meaningful without echo correlation.
        self.make_result(cfg, started_at, requests_sent, requests_sent, Vec::new(), &pre, &post)
    }

    /// Cycle through the configured baud rates, verifying echo at each, and
    /// restore the original rate at the end.
    fn run_baud_flip(&mut self, cfg: &ScenarioConfig) -> ScenarioResult {
        let started_at = now_iso();
        let length = clamp_message_length(cfg.message_length);
        let original_baud = self.transport.baud_rate();
        let baud_rates = if cfg.baud_rates.is_empty() {
            vec![original_baud]
        } else {
            cfg.baud_rates.clone()
        };

        let pre = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);
        let mut total_sent = 0usize;
        let mut total_received = 0usize;
        let mut all_latencies_ms = Vec::new();
        let gap = Duration::from_secs_f64(cfg.pacing_s.max(0.0)).max(Duration::from_millis(20));

        for &baud in &baud_rates {
            log::info!("switching to baud rate {baud}");
            if !self.transport.set_baudrate(baud) {
                log::warn!("failed to set baud rate {baud}, skipping");
                continue;
            }
            thread::sleep(FLIP_SETTLE);
            // The reconfigure replaced the workers and their subscription.
            self.probe.bind(self.transport);

            self.probe.clear_latency();
            for i in 0..cfg.num_messages {
                self.probe.publish(self.transport, i as u16, length);
                thread::sleep(gap);
            }
            thread::sleep(Duration::from_millis(300));

            total_sent += self.probe.sent_count();
            total_received += self.probe.received_count();
            all_latencies_ms.extend(latencies_ms(&self.probe));
        }

        if self.transport.baud_rate() != original_baud {
            if self.transport.set_baudrate(original_baud) {
                self.probe.bind(self.transport);
            } else {
                log::error!("failed to restore baud rate {original_baud}");
            }
        }

        let post = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);
        self.make_result(
            cfg,
            started_at,
            total_sent,
            total_received,
            all_latencies_ms,
            &pre,
            &post,
        )
    }

    /// Write raw garbage to the port, then verify the device recovers and
    /// answers valid echoes within the recovery window.
    fn run_noise_and_recovery(&mut self, cfg: &ScenarioConfig) -> ScenarioResult {
        let started_at = now_iso();
        let length = clamp_message_length(cfg.message_length);
        let pre = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);

        // Non-zero bytes only, so the noise never forms a frame boundary.
        let mut rng = rand::thread_rng();
        let noise: Vec<u8> = (0..cfg.noise_bytes).map(|_| rng.gen_range(1..=255u8)).collect();
        self.transport.write_raw(&noise);
        log::info!("injected {} noise bytes", cfg.noise_bytes);

        thread::sleep(NOISE_SETTLE);
        self.probe.clear_latency();
        let recover_start = Instant::now();

        let gap = Duration::from_secs_f64(cfg.pacing_s.max(0.0)).max(Duration::from_millis(20));
        for i in 0..cfg.num_messages {
            self.probe.publish(self.transport, i as u16, length);
            thread::sleep(gap);
        }

        let deadline =
            recover_start + Duration::from_secs_f64(cfg.thresholds.max_recovery_time_s.max(0.0));
        while Instant::now() < deadline {
            if self.probe.received_count() >= cfg.num_messages {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let post = self.probe.request_snapshot(self.transport, STATUS_REQUEST_TIMEOUT);
        self.make_result(
            cfg,
            started_at,
            self.probe.sent_count(),
            self.probe.received_count(),
            latencies_ms(&self.probe),
            &pre,
            &post,
        )
    }

    /// Build a [`ScenarioResult`] including verdict evaluation.
    fn make_result(
        &self,
        cfg: &ScenarioConfig,
        started_at: String,
        messages_sent: usize,
        messages_received: usize,
        latencies_ms: Vec<f64>,
        pre: &StatusSnapshot,
        post: &StatusSnapshot,
    ) -> ScenarioResult {
        let delta = status_delta(pre, post);
        let task_snapshot: BTreeMap<String, TaskRecord> = post.tasks.clone();
        let (p50_ms, p95_ms, p99_ms) = compute_latency_stats(&latencies_ms);
        let drop_ratio = if messages_sent > 0 {
            messages_sent.saturating_sub(messages_received) as f64 / messages_sent as f64
        } else {
            0.0
        };
        let (verdict, failure_reasons) = evaluate_verdict(
            cfg,
            messages_sent,
            messages_received,
            &latencies_ms,
            &delta.statistics,
        );
        ScenarioResult {
            name: cfg.name.clone(),
            run_id: self.run_id.clone(),
            started_at,
            ended_at: now_iso(),
            command_profile: cfg.command_profile,
            messages_sent,
            messages_received,
            drop_ratio,
            latencies_ms,
            p50_ms,
            p95_ms,
            p99_ms,
            status_delta: delta.statistics,
            task_snapshot,
            verdict,
            failure_reasons,
            tags: cfg.tags.clone(),
        }
    }
}

/// Settle time after a burst: ten pacing intervals, at least half a second.
fn settle_after(pacing_s: f64) -> Duration {
    Duration::from_secs_f64((pacing_s * 10.0).max(0.5))
}

fn latencies_ms(probe: &Arc<Probe>) -> Vec<f64> {
    probe.latencies().iter().map(|v| v * 1e3).collect()
}
