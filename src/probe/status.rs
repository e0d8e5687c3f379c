//! Device status tables
//!
//! The firmware exposes two indexed tables: error/activity counters
//! ([`STATISTICS_SLOTS`]) and per-task runtime accounting ([`TASK_SLOTS`]).
//! Both slot sets are fixed at compile time; responses carrying unknown
//! indices are ignored.
//!
//! All fields live behind a single mutex. Writers (the processor worker)
//! hold it for one field assignment; readers copy a consistent view out and
//! release it before doing anything slow.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// Statistics slots, in wire index order.
pub const STATISTICS_SLOTS: [&str; 14] = [
    "queue_send_error",
    "queue_receive_error",
    "cdc_queue_send_error",
    "display_out_error",
    "led_out_error",
    "watchdog_error",
    "msg_malformed_error",
    "cobs_decode_error",
    "receive_buffer_overflow_error",
    "checksum_error",
    "buffer_overflow_error",
    "unknown_cmd_error",
    "bytes_sent",
    "bytes_received",
];

/// Task slots, in wire index order.
pub const TASK_SLOTS: [&str; 9] = [
    "cdc_task",
    "cdc_write_task",
    "uart_event_task",
    "decode_reception_task",
    "process_outbound_task",
    "adc_read_task",
    "keypad_task",
    "encoder_read_task",
    "idle_task",
];

/// One task's runtime accounting as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub absolute_time_us: u32,
    pub percent_time: u32,
    pub high_watermark: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct StatisticSlot {
    value: u32,
    updated_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
struct TaskSlot {
    record: TaskRecord,
    updated_at: Option<Instant>,
}

#[derive(Debug)]
struct TableInner {
    statistics: [StatisticSlot; STATISTICS_SLOTS.len()],
    tasks: [TaskSlot; TASK_SLOTS.len()],
}

/// Mutex-guarded statistics and task tables.
#[derive(Debug)]
pub struct StatusTable {
    inner: Mutex<TableInner>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                statistics: [StatisticSlot::default(); STATISTICS_SLOTS.len()],
                tasks: [TaskSlot::default(); TASK_SLOTS.len()],
            }),
        }
    }

    /// Store a statistics response. Unknown indices are ignored.
    pub fn record_statistic(&self, index: u8, value: u32) {
        let index = index as usize;
        if index >= STATISTICS_SLOTS.len() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.statistics[index] = StatisticSlot {
            value,
            updated_at: Some(Instant::now()),
        };
    }

    /// Store a task response. Unknown indices are ignored.
    pub fn record_task(&self, index: u8, record: TaskRecord) {
        let index = index as usize;
        if index >= TASK_SLOTS.len() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.tasks[index] = TaskSlot {
            record,
            updated_at: Some(Instant::now()),
        };
    }

    /// How many statistics and task slots have been updated since `marker`.
    pub fn counts_since(&self, marker: Instant) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let statistics = inner
            .statistics
            .iter()
            .filter(|slot| slot.updated_at.is_some_and(|at| at >= marker))
            .count();
        let tasks = inner
            .tasks
            .iter()
            .filter(|slot| slot.updated_at.is_some_and(|at| at >= marker))
            .count();
        (statistics, tasks)
    }

    /// Consistent copy of both tables plus the per-slot receipt counts
    /// relative to `marker`.
    pub fn snapshot(&self, marker: Instant) -> StatusSnapshot {
        let inner = self.inner.lock().unwrap();
        let statistics = STATISTICS_SLOTS
            .iter()
            .zip(inner.statistics.iter())
            .map(|(name, slot)| (name.to_string(), slot.value))
            .collect();
        let tasks = TASK_SLOTS
            .iter()
            .zip(inner.tasks.iter())
            .map(|(name, slot)| (name.to_string(), slot.record))
            .collect();
        let received_statistics = inner
            .statistics
            .iter()
            .filter(|slot| slot.updated_at.is_some_and(|at| at >= marker))
            .count();
        let received_tasks = inner
            .tasks
            .iter()
            .filter(|slot| slot.updated_at.is_some_and(|at| at >= marker))
            .count();
        StatusSnapshot {
            statistics,
            tasks,
            received_statistics,
            received_tasks,
            complete: received_statistics == STATISTICS_SLOTS.len()
                && received_tasks == TASK_SLOTS.len(),
        }
    }
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable point-in-time copy of the device status tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub statistics: BTreeMap<String, u32>,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub received_statistics: usize,
    pub received_tasks: usize,
    pub complete: bool,
}

impl StatusSnapshot {
    /// Snapshot for a link that never answered (or was never open).
    pub fn empty() -> Self {
        Self {
            statistics: BTreeMap::new(),
            tasks: BTreeMap::new(),
            received_statistics: 0,
            received_tasks: 0,
            complete: false,
        }
    }
}

/// Field-wise difference of two task records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDelta {
    pub absolute_time_us: i64,
    pub percent_time: i64,
    pub high_watermark: i64,
}

/// Difference between two status snapshots, slot by slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDelta {
    pub statistics: BTreeMap<String, i64>,
    pub tasks: BTreeMap<String, TaskDelta>,
}

/// Compute `after - before` for every slot; missing keys count as zero.
pub fn status_delta(before: &StatusSnapshot, after: &StatusSnapshot) -> StatusDelta {
    let statistics = STATISTICS_SLOTS
        .iter()
        .map(|&name| {
            let b = before.statistics.get(name).copied().unwrap_or(0) as i64;
            let a = after.statistics.get(name).copied().unwrap_or(0) as i64;
            (name.to_string(), a - b)
        })
        .collect();
    let tasks = TASK_SLOTS
        .iter()
        .map(|&name| {
            let b = before.tasks.get(name).copied().unwrap_or_default();
            let a = after.tasks.get(name).copied().unwrap_or_default();
            (
                name.to_string(),
                TaskDelta {
                    absolute_time_us: a.absolute_time_us as i64 - b.absolute_time_us as i64,
                    percent_time: a.percent_time as i64 - b.percent_time as i64,
                    high_watermark: a.high_watermark as i64 - b.high_watermark as i64,
                },
            )
        })
        .collect();
    StatusDelta { statistics, tasks }
}
