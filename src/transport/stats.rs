//! Transport statistics
//!
//! Process-wide byte and command counters for the serial link. The publish
//! path updates the sent side while the processor worker updates the
//! received side, so the hot counters are kept on separate cache lines and
//! all updates are relaxed atomics.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Command codes are 5 bits wide.
const COMMAND_SLOTS: usize = 32;

/// Cache-line aligned atomic counter to prevent false sharing
///
/// The sent and received counters are updated by different threads at frame
/// rate; padding each to its own 64-byte line keeps those updates from
/// invalidating each other.
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte and per-command counters for one transport instance.
#[derive(Debug, Default)]
pub struct TransportStats {
    bytes_sent: AlignedCounter,
    bytes_received: AlignedCounter,
    commands_sent: [AtomicU64; COMMAND_SLOTS],
    commands_received: [AtomicU64; COMMAND_SLOTS],
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_bytes_sent(&self, n: u64) {
        self.bytes_sent.add(n);
    }

    #[inline]
    pub fn record_bytes_received(&self, n: u64) {
        self.bytes_received.add(n);
    }

    #[inline]
    pub fn record_command_sent(&self, code: u8) {
        self.commands_sent[(code & 0x1F) as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_received(&self, code: u8) {
        self.commands_received[(code & 0x1F) as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.get()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.get()
    }

    pub fn commands_sent(&self, code: u8) -> u64 {
        self.commands_sent[(code & 0x1F) as usize].load(Ordering::Relaxed)
    }

    pub fn commands_received(&self, code: u8) -> u64 {
        self.commands_received[(code & 0x1F) as usize].load(Ordering::Relaxed)
    }

    /// Point-in-time copy for reporting; only non-zero command slots appear.
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        let collect = |slots: &[AtomicU64; COMMAND_SLOTS]| {
            slots
                .iter()
                .enumerate()
                .filter_map(|(code, count)| {
                    let count = count.load(Ordering::Relaxed);
                    (count > 0).then_some((code as u8, count))
                })
                .collect()
        };
        TransportStatsSnapshot {
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            commands_sent: collect(&self.commands_sent),
            commands_received: collect(&self.commands_received),
        }
    }
}

/// Serialisable copy of [`TransportStats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_sent: BTreeMap<u8, u64>,
    pub commands_received: BTreeMap<u8, u64>,
}
