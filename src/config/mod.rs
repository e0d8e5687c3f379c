//! Harness configuration
//!
//! Declarative stress-run configuration: a list of scenarios with their
//! pass/fail thresholds, plus an output directory for result artifacts.
//! Configurations load from TOML files or come from
//! [`default_stress_config`], which produces the five canonical scenarios.

pub mod cli;

use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Standard sweep rates, slowest first.
pub const DEFAULT_BAUD_RATES: [u32; 8] = [
    9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 921_600,
];

/// Default directory for result artifacts.
pub const TEST_RESULTS_FOLDER: &str = "test-results";

/// Pass/fail thresholds for a single scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScenarioThresholds {
    /// Echo drop ratio above which the scenario fails; 0.001 means 99.9%
    /// of echoes must come back.
    pub max_echo_drop_ratio: f64,
    /// P95 round-trip latency in milliseconds; exceeding it is a WARN.
    pub max_p95_latency_ms: f64,
    /// Longest acceptable recovery window after a noise burst, seconds.
    pub max_recovery_time_s: f64,
    /// Per-counter limits on how much an error counter may grow during the
    /// scenario. Keys are statistics slot names; missing keys mean no limit.
    /// Kept last so TOML serialisation emits it after the plain values.
    pub max_error_counter_deltas: BTreeMap<String, i64>,
}

impl Default for ScenarioThresholds {
    fn default() -> Self {
        Self {
            max_echo_drop_ratio: 0.001,
            max_error_counter_deltas: BTreeMap::new(),
            max_p95_latency_ms: 50.0,
            max_recovery_time_s: 2.0,
        }
    }
}

/// The five scenario kinds the stress runner knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandProfile {
    EchoOnly,
    Mixed,
    StatusPoll,
    BaudFlip,
    NoiseAndRecovery,
}

impl std::fmt::Display for CommandProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandProfile::EchoOnly => "echo_only",
            CommandProfile::Mixed => "mixed",
            CommandProfile::StatusPoll => "status_poll",
            CommandProfile::BaudFlip => "baud_flip",
            CommandProfile::NoiseAndRecovery => "noise_and_recovery",
        };
        write!(f, "{name}")
    }
}

/// Definition of a single stress scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioConfig {
    pub name: String,
    pub duration_s: f64,
    pub command_profile: CommandProfile,
    /// Inter-message gap in seconds; 0 = maximum rate.
    #[serde(default)]
    pub pacing_s: f64,
    /// Echo payload length, 6..=10 bytes.
    #[serde(default = "default_message_length")]
    pub message_length: u8,
    #[serde(default = "default_num_messages")]
    pub num_messages: usize,
    /// Rates exercised by the baud_flip profile.
    #[serde(default)]
    pub baud_rates: Vec<u32>,
    /// Raw bytes injected by the noise_and_recovery profile.
    #[serde(default = "default_noise_bytes")]
    pub noise_bytes: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Kept last so TOML serialisation emits the table after the values.
    #[serde(default)]
    pub thresholds: ScenarioThresholds,
}

fn default_message_length() -> u8 {
    10
}

fn default_num_messages() -> usize {
    500
}

fn default_noise_bytes() -> usize {
    64
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(TEST_RESULTS_FOLDER)
}

/// Top-level configuration for a stress run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StressConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub scenarios: Vec<ScenarioConfig>,
}

/// Ready-to-run configuration with the five canonical scenarios.
pub fn default_stress_config() -> StressConfig {
    StressConfig {
        output_dir: default_output_dir(),
        scenarios: vec![
            ScenarioConfig {
                name: "echo_burst".into(),
                duration_s: 30.0,
                command_profile: CommandProfile::EchoOnly,
                pacing_s: 0.005,
                message_length: 10,
                num_messages: 500,
                baud_rates: Vec::new(),
                noise_bytes: default_noise_bytes(),
                thresholds: ScenarioThresholds {
                    max_echo_drop_ratio: 0.001,
                    max_error_counter_deltas: [("buffer_overflow_error".to_string(), 0)]
                        .into_iter()
                        .collect(),
                    max_p95_latency_ms: 50.0,
                    ..Default::default()
                },
                tags: vec!["ci".into(), "quick".into()],
            },
            ScenarioConfig {
                name: "mixed_command_burst".into(),
                duration_s: 45.0,
                command_profile: CommandProfile::Mixed,
                pacing_s: 0.01,
                message_length: 10,
                num_messages: 400,
                baud_rates: Vec::new(),
                noise_bytes: default_noise_bytes(),
                thresholds: ScenarioThresholds {
                    max_echo_drop_ratio: 0.005,
                    max_p95_latency_ms: 100.0,
                    ..Default::default()
                },
                tags: vec!["ci".into()],
            },
            ScenarioConfig {
                name: "status_poll_storm".into(),
                duration_s: 20.0,
                command_profile: CommandProfile::StatusPoll,
                pacing_s: 0.0,
                message_length: 10,
                num_messages: 200,
                baud_rates: Vec::new(),
                noise_bytes: default_noise_bytes(),
                thresholds: ScenarioThresholds {
                    // No echo traffic, so drops cannot fail the scenario.
                    max_echo_drop_ratio: 1.0,
                    max_error_counter_deltas: [("queue_send_error".to_string(), 0)]
                        .into_iter()
                        .collect(),
                    max_p95_latency_ms: 200.0,
                    ..Default::default()
                },
                tags: vec!["ci".into()],
            },
            ScenarioConfig {
                name: "baud_flip".into(),
                duration_s: 60.0,
                command_profile: CommandProfile::BaudFlip,
                pacing_s: 0.0,
                message_length: 10,
                // Echo verifications per baud rate.
                num_messages: 5,
                baud_rates: vec![9600, 57600, 115_200, 230_400],
                noise_bytes: default_noise_bytes(),
                thresholds: ScenarioThresholds {
                    max_echo_drop_ratio: 0.0,
                    max_p95_latency_ms: 200.0,
                    max_recovery_time_s: 3.0,
                    ..Default::default()
                },
                tags: vec!["hil".into()],
            },
            ScenarioConfig {
                name: "noise_and_recovery".into(),
                duration_s: 15.0,
                command_profile: CommandProfile::NoiseAndRecovery,
                pacing_s: 0.0,
                message_length: 10,
                // Echo verifications after the noise burst.
                num_messages: 10,
                baud_rates: Vec::new(),
                noise_bytes: 64,
                thresholds: ScenarioThresholds {
                    max_echo_drop_ratio: 0.0,
                    max_p95_latency_ms: 2000.0,
                    max_recovery_time_s: 2.0,
                    ..Default::default()
                },
                tags: vec!["ci".into(), "fault_injection".into()],
            },
        ],
    }
}

/// Load a [`StressConfig`] from a TOML file.
pub fn load_stress_config(path: &Path) -> Result<StressConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_five_scenarios() {
        let config = default_stress_config();
        assert_eq!(config.scenarios.len(), 5);
        let names: Vec<&str> = config.scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "echo_burst",
                "mixed_command_burst",
                "status_poll_storm",
                "baud_flip",
                "noise_and_recovery"
            ]
        );
    }

    #[test]
    fn test_default_thresholds() {
        let thresholds = ScenarioThresholds::default();
        assert_eq!(thresholds.max_echo_drop_ratio, 0.001);
        assert_eq!(thresholds.max_p95_latency_ms, 50.0);
        assert_eq!(thresholds.max_recovery_time_s, 2.0);
        assert!(thresholds.max_error_counter_deltas.is_empty());
    }

    #[test]
    fn test_toml_roundtrip_with_defaults() {
        let toml_str = r#"
            output_dir = "results"

            [[scenarios]]
            name = "quick_echo"
            duration_s = 5.0
            command_profile = "echo_only"
            num_messages = 50

            [scenarios.thresholds]
            max_echo_drop_ratio = 0.01
            max_error_counter_deltas = { buffer_overflow_error = 0 }
        "#;
        let config: StressConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("results"));
        assert_eq!(config.scenarios.len(), 1);
        let scenario = &config.scenarios[0];
        assert_eq!(scenario.command_profile, CommandProfile::EchoOnly);
        assert_eq!(scenario.message_length, 10);
        assert_eq!(scenario.pacing_s, 0.0);
        assert_eq!(scenario.thresholds.max_echo_drop_ratio, 0.01);
        assert_eq!(
            scenario.thresholds.max_error_counter_deltas["buffer_overflow_error"],
            0
        );
        // Unset threshold fields fall back to defaults.
        assert_eq!(scenario.thresholds.max_p95_latency_ms, 50.0);
    }

    #[test]
    fn test_load_stress_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stress.toml");
        let config = default_stress_config();
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        let loaded = load_stress_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(load_stress_config(Path::new("/nonexistent/stress.toml")).is_err());
    }
}
