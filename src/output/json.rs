//! JSON artifact writers
//!
//! All artifacts are pretty-printed UTF-8 JSON. Burst and sweep files carry
//! a local wall-clock stamp in the name; stress reports are keyed by run id.

use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// `<dir>/<YYYYMMDD_HHMMSS>_<suffix>.json`
pub fn timestamped_path(dir: &Path, suffix: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{stamp}_{suffix}.json"))
}

/// Serialise `value` pretty-printed to `path`, creating parent directories.
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write {}", path.display()))?;
    log::info!("test results written to {}", path.display());
    Ok(path.to_path_buf())
}

/// Write a burst result array to `<dir>/<stamp>_output.json`.
pub fn write_burst_results<T: Serialize>(dir: &Path, records: &T) -> Result<PathBuf> {
    write_json_pretty(&timestamped_path(dir, "output"), records)
}

/// Write a sweep result array to `<dir>/<stamp>_baud_sweep.json`.
pub fn write_baud_sweep_results<T: Serialize>(dir: &Path, records: &T) -> Result<PathBuf> {
    write_json_pretty(&timestamped_path(dir, "baud_sweep"), records)
}

/// Write a stress run report to `<dir>/<run_id>_stress.json`.
pub fn write_stress_report<T: Serialize>(dir: &Path, run_id: &str, result: &T) -> Result<PathBuf> {
    write_json_pretty(&dir.join(format!("{run_id}_stress.json")), result)
}
