//! uartpulse CLI entry point

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uartpulse::config::cli::{Cli, CliCommand};
use uartpulse::config::{default_stress_config, load_stress_config};
use uartpulse::output::summary::print_status_snapshot;
use uartpulse::port::HardwarePort;
use uartpulse::probe::{Probe, STATUS_REQUEST_TIMEOUT};
use uartpulse::protocol;
use uartpulse::runner::baud::{run_baud_sweep, BaudSweepOptions};
use uartpulse::runner::burst::{run_burst, BurstOptions};
use uartpulse::runner::stress::StressRunner;
use uartpulse::transport::Transport;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let port = HardwarePort::new(&cli.port, cli.baud);
    let mut transport = Transport::new(Box::new(port));
    transport
        .open()
        .with_context(|| format!("cannot open serial port {}", cli.port))?;
    let probe = Probe::new();
    probe.bind(&transport);

    let outcome = run_command(&cli, &mut transport, &probe);
    transport.close();
    outcome
}

fn run_command(cli: &Cli, transport: &mut Transport, probe: &Arc<Probe>) -> Result<()> {
    match &cli.command {
        CliCommand::Latency {
            num_times,
            min_wait,
            max_wait,
            wait_time,
            samples,
            length,
            jitter,
        } => {
            let opts = BurstOptions {
                num_times: *num_times,
                min_wait: *min_wait,
                max_wait: *max_wait,
                wait_time: *wait_time,
                samples: *samples,
                message_length: *length,
                jitter: *jitter,
            };
            let (records, path) = run_burst(transport, probe, &cli.output_dir, &opts)?;
            println!(
                "{} burst(s) recorded, results in {}",
                records.len(),
                path.display()
            );
        }

        CliCommand::BaudSweep {
            rates,
            samples,
            wait_time,
            length,
            no_restore,
        } => {
            let opts = BaudSweepOptions {
                baud_rates: rates
                    .clone()
                    .unwrap_or_else(|| uartpulse::config::DEFAULT_BAUD_RATES.to_vec()),
                samples: *samples,
                wait_time: *wait_time,
                message_length: *length,
                restore_baudrate: !no_restore,
            };
            let (records, path) = run_baud_sweep(transport, probe, &cli.output_dir, &opts)?;
            println!(
                "{} rate(s) swept, results in {}",
                records.len(),
                path.display()
            );
        }

        CliCommand::Stress { config, scenario } => {
            let config = match config {
                Some(path) => load_stress_config(path)?,
                None => {
                    let mut config = default_stress_config();
                    config.output_dir = cli.output_dir.clone();
                    config
                }
            };
            let mut runner =
                StressRunner::new(transport, Arc::clone(probe), config, cli.port.clone());
            runner.execute(scenario.as_deref())?;
        }

        CliCommand::Status => {
            let snapshot = probe.request_snapshot(transport, STATUS_REQUEST_TIMEOUT);
            print_status_snapshot(&snapshot);
            let link = transport.stats().snapshot();
            println!(
                "  Link: {} bytes sent, {} bytes received",
                link.bytes_sent, link.bytes_received
            );
        }

        CliCommand::Send { hex } => {
            let payload = parse_hex(hex)?;
            transport.set_message_handler(Arc::new(|command, decoded, raw| {
                // Analog frames arrive continuously and would bury the reply.
                if command != protocol::Command::Analog.code() {
                    println!("received raw: {raw:02x?}, decoded: {decoded:02x?}");
                    print_decoded(decoded);
                }
            }));
            transport.write(&payload);
            transport.flush();
            // Give the device a moment to answer before shutting down.
            thread::sleep(Duration::from_secs(1));
        }
    }
    Ok(())
}

/// Parse a hex command string into payload bytes.
fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        bail!("invalid hex data '{hex}'");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| anyhow::anyhow!("invalid hex data '{hex}'"))
        })
        .collect()
}

/// Pretty-print the protocol fields of a decoded payload.
fn print_decoded(decoded: &[u8]) {
    let Some(fields) = protocol::frame_fields(decoded) else {
        println!("decoded message too short: {decoded:02x?}");
        return;
    };
    println!(
        "id: {}, command: {}, length: {}, checksum: {:?}",
        fields.rx_id, fields.command, fields.length, fields.checksum
    );

    match protocol::Command::from_code(fields.command) {
        Some(protocol::Command::Key) => {
            if let Some(key) = protocol::key_event(decoded) {
                println!(
                    "column: {}, row: {}, state: {}, length: {}",
                    key.col, key.row, key.state, fields.length
                );
            }
        }
        Some(protocol::Command::Analog) => {
            if let Some(reading) = protocol::analog_reading(decoded) {
                println!("channel: {}, value: {}", reading.channel, reading.value);
            }
        }
        _ => {}
    }
}
