//! uartpulse - Serial link characterisation harness
//!
//! uartpulse drives a firmware device over a UART link that speaks a
//! COBS-framed, XOR-checksum-protected binary protocol. It measures
//! round-trip latency with counter-stamped echo messages, polls the
//! device's error counters and per-task accounting, runs scripted stress
//! scenarios, and writes structured JSON result artifacts.
//!
//! # Architecture
//!
//! - **Framed transport**: COBS codec, receive framer with RTS watermarks,
//!   reader/processor worker pair coupled by a bounded queue
//! - **Pluggable ports**: real hardware via `serialport`, loopback stub for tests
//! - **Measurement**: dense counter-keyed echo tables, per-burst stats,
//!   status snapshots with deadline and deltas
//! - **Controllers**: latency bursts, baud-rate sweeps, stress scenarios
//!   with PASS/WARN/FAIL verdicts

pub mod config;
pub mod output;
pub mod port;
pub mod probe;
pub mod protocol;
pub mod runner;
pub mod transport;

// Re-export commonly used types
pub use port::SerialPort;
pub use transport::Transport;

/// Result type used throughout uartpulse
pub type Result<T> = anyhow::Result<T>;
