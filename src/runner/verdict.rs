//! Verdict engine
//!
//! Pure evaluation of scenario outcomes against configured thresholds.
//! Nothing here touches the transport, so every rule is covered by fast
//! hardware-free tests. Verdicts are data: FAIL/WARN reasons ride along in
//! the result, they are never raised.

use crate::config::{CommandProfile, ScenarioConfig};
use crate::probe::percentile;
use crate::probe::status::TaskRecord;
use serde::Serialize;
use std::collections::BTreeMap;

/// Error counters that explain message drops during a noise burst.
const EXPLAINED_DROP_COUNTERS: [&str; 5] = [
    "cobs_decode_error",
    "msg_malformed_error",
    "checksum_error",
    "receive_buffer_overflow_error",
    "buffer_overflow_error",
];

/// Scenario and run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "FAIL")]
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Warn => write!(f, "WARN"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Outcome of a single stress scenario execution.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub run_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub command_profile: CommandProfile,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub drop_ratio: f64,
    pub latencies_ms: Vec<f64>,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Error counter deltas over the scenario.
    pub status_delta: BTreeMap<String, i64>,
    /// Task table as reported after the scenario.
    pub task_snapshot: BTreeMap<String, TaskRecord>,
    pub verdict: Verdict,
    pub failure_reasons: Vec<String>,
    pub tags: Vec<String>,
}

/// Aggregated outcome of a full stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressRunResult {
    pub run_id: String,
    pub port: String,
    pub baudrate: u32,
    pub started_at: String,
    pub ended_at: String,
    pub scenarios: Vec<ScenarioResult>,
    pub overall_verdict: Verdict,
}

/// (p50, p95, p99) of a latency sample in milliseconds.
pub fn compute_latency_stats(latencies_ms: &[f64]) -> (f64, f64, f64) {
    (
        percentile(latencies_ms, 50.0),
        percentile(latencies_ms, 95.0),
        percentile(latencies_ms, 99.0),
    )
}

/// Evaluate a scenario's verdict and failure reasons.
///
/// Pure function of the configuration and the measured counters: calling it
/// twice with the same inputs yields identical results.
pub fn evaluate_verdict(
    cfg: &ScenarioConfig,
    messages_sent: usize,
    messages_received: usize,
    latencies_ms: &[f64],
    status_delta: &BTreeMap<String, i64>,
) -> (Verdict, Vec<String>) {
    let thresholds = &cfg.thresholds;
    let mut reasons = Vec::new();
    let mut is_fail = false;
    let mut is_warn = false;

    let dropped = messages_sent.saturating_sub(messages_received);

    // Noise corrupts in-flight frames; drops the device itself accounts for
    // in its error counters do not count against the link.
    let drop_ratio = if cfg.command_profile == CommandProfile::NoiseAndRecovery {
        let explained: i64 = EXPLAINED_DROP_COUNTERS
            .iter()
            .map(|&key| status_delta.get(key).copied().unwrap_or(0))
            .sum();
        let unexplained = (dropped as i64 - explained).max(0);
        if messages_sent > 0 {
            unexplained as f64 / messages_sent as f64
        } else {
            0.0
        }
    } else if messages_sent > 0 {
        dropped as f64 / messages_sent as f64
    } else {
        0.0
    };
    if drop_ratio > thresholds.max_echo_drop_ratio {
        reasons.push(format!(
            "drop_ratio={drop_ratio:.4} exceeds limit={:.4}",
            thresholds.max_echo_drop_ratio
        ));
        is_fail = true;
    }

    for (key, &limit) in &thresholds.max_error_counter_deltas {
        let delta = status_delta.get(key).copied().unwrap_or(0);
        if delta > limit {
            reasons.push(format!("counter '{key}' increased by {delta} (limit={limit})"));
            is_fail = true;
        }
    }

    let (_, p95, _) = compute_latency_stats(latencies_ms);
    if p95 > thresholds.max_p95_latency_ms {
        reasons.push(format!(
            "P95 latency={p95:.1}ms exceeds limit={:.1}ms",
            thresholds.max_p95_latency_ms
        ));
        is_warn = true;
    }

    if is_fail {
        (Verdict::Fail, reasons)
    } else if is_warn {
        (Verdict::Warn, reasons)
    } else {
        (Verdict::Pass, Vec::new())
    }
}

/// FAIL if any scenario failed, WARN if any warned, else PASS.
pub fn aggregate_verdict(results: &[ScenarioResult]) -> Verdict {
    if results.iter().any(|r| r.verdict == Verdict::Fail) {
        Verdict::Fail
    } else if results.iter().any(|r| r.verdict == Verdict::Warn) {
        Verdict::Warn
    } else {
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_stress_config, ScenarioThresholds};

    fn scenario(profile: CommandProfile, thresholds: ScenarioThresholds) -> ScenarioConfig {
        ScenarioConfig {
            name: "test".into(),
            duration_s: 1.0,
            command_profile: profile,
            pacing_s: 0.0,
            message_length: 10,
            num_messages: 10,
            baud_rates: Vec::new(),
            noise_bytes: 0,
            thresholds,
            tags: Vec::new(),
        }
    }

    fn result_with_verdict(verdict: Verdict) -> ScenarioResult {
        ScenarioResult {
            name: "test".into(),
            run_id: "run".into(),
            started_at: String::new(),
            ended_at: String::new(),
            command_profile: CommandProfile::EchoOnly,
            messages_sent: 0,
            messages_received: 0,
            drop_ratio: 0.0,
            latencies_ms: Vec::new(),
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            status_delta: BTreeMap::new(),
            task_snapshot: BTreeMap::new(),
            verdict,
            failure_reasons: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_drop_ratio_over_limit_fails() {
        let cfg = scenario(
            CommandProfile::EchoOnly,
            ScenarioThresholds {
                max_echo_drop_ratio: 0.001,
                ..Default::default()
            },
        );
        let (verdict, reasons) = evaluate_verdict(&cfg, 1000, 990, &[], &BTreeMap::new());
        assert_eq!(verdict, Verdict::Fail);
        assert!(reasons.iter().any(|r| r.contains("drop_ratio")));
    }

    #[test]
    fn test_drop_ratio_at_limit_passes() {
        let cfg = scenario(
            CommandProfile::EchoOnly,
            ScenarioThresholds {
                max_echo_drop_ratio: 0.001,
                ..Default::default()
            },
        );
        // Exactly 0.001 does not exceed the limit.
        let (verdict, reasons) = evaluate_verdict(&cfg, 1000, 999, &[], &BTreeMap::new());
        assert_eq!(verdict, Verdict::Pass);
        assert!(reasons.is_empty());
    }

    #[test]
    fn test_noise_profile_subtracts_explained_drops() {
        let cfg = scenario(
            CommandProfile::NoiseAndRecovery,
            ScenarioThresholds {
                max_echo_drop_ratio: 0.0,
                ..Default::default()
            },
        );
        let mut delta = BTreeMap::new();
        delta.insert("cobs_decode_error".to_string(), 2i64);
        delta.insert("checksum_error".to_string(), 1i64);
        // 3 drops, all explained by counters.
        let (verdict, _) = evaluate_verdict(&cfg, 10, 7, &[], &delta);
        assert_eq!(verdict, Verdict::Pass);

        // 4 drops, only 3 explained.
        let (verdict, reasons) = evaluate_verdict(&cfg, 10, 6, &[], &delta);
        assert_eq!(verdict, Verdict::Fail);
        assert!(reasons[0].contains("drop_ratio"));
    }

    #[test]
    fn test_counter_delta_over_limit_fails() {
        let cfg = scenario(
            CommandProfile::EchoOnly,
            ScenarioThresholds {
                max_error_counter_deltas: [("buffer_overflow_error".to_string(), 0)]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );
        let mut delta = BTreeMap::new();
        delta.insert("buffer_overflow_error".to_string(), 2i64);
        let (verdict, reasons) = evaluate_verdict(&cfg, 10, 10, &[], &delta);
        assert_eq!(verdict, Verdict::Fail);
        assert!(reasons[0].contains("buffer_overflow_error"));
    }

    #[test]
    fn test_p95_over_limit_warns_only() {
        let cfg = scenario(
            CommandProfile::EchoOnly,
            ScenarioThresholds {
                max_p95_latency_ms: 50.0,
                ..Default::default()
            },
        );
        let latencies = vec![60.0; 20];
        let (verdict, reasons) = evaluate_verdict(&cfg, 10, 10, &latencies, &BTreeMap::new());
        assert_eq!(verdict, Verdict::Warn);
        assert!(reasons[0].contains("P95"));
    }

    #[test]
    fn test_warn_does_not_override_fail() {
        let cfg = scenario(
            CommandProfile::EchoOnly,
            ScenarioThresholds {
                max_echo_drop_ratio: 0.0,
                max_p95_latency_ms: 50.0,
                ..Default::default()
            },
        );
        let latencies = vec![60.0; 5];
        let (verdict, reasons) = evaluate_verdict(&cfg, 10, 5, &latencies, &BTreeMap::new());
        assert_eq!(verdict, Verdict::Fail);
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn test_zero_sent_is_pass() {
        let cfg = scenario(CommandProfile::EchoOnly, ScenarioThresholds::default());
        let (verdict, _) = evaluate_verdict(&cfg, 0, 0, &[], &BTreeMap::new());
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let cfg = default_stress_config().scenarios[0].clone();
        let latencies = vec![1.0, 2.0, 3.0];
        let mut delta = BTreeMap::new();
        delta.insert("checksum_error".to_string(), 1i64);
        let first = evaluate_verdict(&cfg, 100, 97, &latencies, &delta);
        let second = evaluate_verdict(&cfg, 100, 97, &latencies, &delta);
        assert_eq!(first, second);
    }

    #[test]
    fn test_aggregate_verdict() {
        assert_eq!(aggregate_verdict(&[]), Verdict::Pass);
        assert_eq!(
            aggregate_verdict(&[result_with_verdict(Verdict::Pass)]),
            Verdict::Pass
        );
        assert_eq!(
            aggregate_verdict(&[
                result_with_verdict(Verdict::Pass),
                result_with_verdict(Verdict::Warn)
            ]),
            Verdict::Warn
        );
        assert_eq!(
            aggregate_verdict(&[
                result_with_verdict(Verdict::Warn),
                result_with_verdict(Verdict::Fail)
            ]),
            Verdict::Fail
        );
    }
}
