//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Serial link characterisation harness for COBS-framed firmware devices.
#[derive(Debug, Parser)]
#[command(name = "uartpulse", version, about)]
pub struct Cli {
    /// Serial port device path (e.g. /dev/ttyUSB0)
    #[arg(short, long, env = "UARTPULSE_PORT")]
    pub port: String,

    /// Baud rate for the link
    #[arg(short, long, default_value_t = 115_200, env = "UARTPULSE_BAUD")]
    pub baud: u32,

    /// Directory for result artifacts
    #[arg(long, default_value = super::TEST_RESULTS_FOLDER)]
    pub output_dir: PathBuf,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run paced echo bursts and record round-trip latency statistics
    Latency {
        /// Number of bursts; the inter-message wait interpolates from
        /// min-wait to max-wait across them
        #[arg(long, default_value_t = 10)]
        num_times: usize,

        /// Inter-message wait for the first burst, seconds
        #[arg(long, default_value_t = 0.0)]
        min_wait: f64,

        /// Inter-message wait for the last burst, seconds
        #[arg(long, default_value_t = 0.7)]
        max_wait: f64,

        /// Settle time after each burst to collect late responses, seconds
        #[arg(long, default_value_t = 3.0)]
        wait_time: f64,

        /// Echo messages per burst (max 65536)
        #[arg(long, default_value_t = 255)]
        samples: usize,

        /// Echo payload length in bytes (6..=10; out of range uses 10)
        #[arg(long, default_value_t = 10)]
        length: u8,

        /// Add uniform random jitter to the inter-message wait
        #[arg(long)]
        jitter: bool,
    },

    /// Sweep baud rates and run a latency burst at each rate
    BaudSweep {
        /// Comma-separated rates; defaults to the standard sweep set
        #[arg(long, value_delimiter = ',')]
        rates: Option<Vec<u32>>,

        /// Echo messages per rate (max 65536)
        #[arg(long, default_value_t = 255)]
        samples: usize,

        /// Settle time after each burst, seconds
        #[arg(long, default_value_t = 3.0)]
        wait_time: f64,

        /// Echo payload length in bytes (6..=10; out of range uses 10)
        #[arg(long, default_value_t = 10)]
        length: u8,

        /// Leave the link at the last swept rate instead of restoring
        #[arg(long)]
        no_restore: bool,
    },

    /// Run stress scenarios and emit a PASS/WARN/FAIL report
    Stress {
        /// TOML scenario configuration; defaults to the built-in scenarios
        #[arg(long)]
        config: Option<PathBuf>,

        /// Run only the named scenario from the configuration
        #[arg(long)]
        scenario: Option<String>,
    },

    /// Request one status snapshot and print the device tables
    Status,

    /// Send a raw hex payload through the framed write path
    Send {
        /// Payload as hex digits, e.g. 003403000702
        hex: String,
    },
}
