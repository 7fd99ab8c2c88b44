//! Per-sensor, per-day append-only text logs.
//!
//! Files live at `base/YYYY/MM/DD/<type>/<name>.txt` and hold one line per record:
//!
//! ```text
//! 1700000000.123\t4.2152\t88
//! ```
//!
//! (timestamp, value, optional sync number). The day is the local calendar day and
//! a new file is opened the first time a record arrives after midnight.

use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{Datelike, Local, NaiveDate};
use tracing::{debug, warn};

use super::format::{format_g, percent_encode};
use super::{LogRecord, LogValue, Logger};
use crate::error::{AppResult, DaqError};
use crate::sensor::SensorType;

/// Downsample factors at or above this use the median instead of the mean.
pub const MEDIAN_THRESHOLD: usize = 6;

/// Date-sharded text log for a single sensor.
pub struct DateShardedLog {
    base: PathBuf,
    name: String,
    sensor_type: SensorType,
    file_name: String,
    alias_name: Option<String>,
    downsample: usize,
    state: Mutex<LogState>,
}

#[derive(Default)]
struct LogState {
    pending: Vec<f64>,
    day: Option<NaiveDate>,
    file: Option<LineWriter<File>>,
}

impl DateShardedLog {
    /// Create a log. No file is opened until the first record.
    ///
    /// A `downsample` of 0 is treated as 1.
    pub fn new(
        base: impl Into<PathBuf>,
        name: &str,
        sensor_type: SensorType,
        alias: Option<&str>,
        downsample: usize,
    ) -> Self {
        Self {
            base: base.into(),
            name: name.to_string(),
            sensor_type,
            file_name: format!("{}.txt", percent_encode(name)),
            alias_name: alias.map(|a| format!("{}.txt", percent_encode(a))),
            downsample: downsample.max(1),
            state: Mutex::new(LogState::default()),
        }
    }

    /// Sensor name this log was created for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of raw samples aggregated into one line.
    pub fn downsample(&self) -> usize {
        self.downsample
    }

    /// Directory holding the file for `day`.
    pub fn dir_for(&self, day: NaiveDate) -> PathBuf {
        self.base
            .join(format!("{:04}", day.year()))
            .join(format!("{:02}", day.month()))
            .join(format!("{:02}", day.day()))
            .join(percent_encode(&self.sensor_type.to_string()))
    }

    /// Full path of the file for `day`.
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir_for(day).join(&self.file_name)
    }

    /// Log a record as if today were `day`.
    pub fn log_on(&self, record: &LogRecord<'_>, day: NaiveDate) -> AppResult<()> {
        if record.sensor_type != self.sensor_type {
            return Err(DaqError::Persistence(format!(
                "{} log for '{}' got a {} record",
                self.sensor_type, self.name, record.sensor_type
            )));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let value = match record.value {
            LogValue::Number(v) if self.downsample > 1 => {
                state.pending.push(v);
                if state.pending.len() < self.downsample {
                    return Ok(());
                }
                let reduced = aggregate(&state.pending);
                state.pending.clear();
                format_g(reduced, 8)
            }
            LogValue::Number(v) => format_g(v, 8),
            LogValue::Text(t) => t.to_string(),
        };

        let mut line = format!("{:.3}\t{}", record.timestamp, value);
        if let Some(sync) = record.sync {
            line.push_str(&format!("\t{}", sync));
        }
        line.push('\n');

        if state.day != Some(day) || state.file.is_none() {
            state.file = None;
            state.file = Some(self.open(day)?);
            state.day = Some(day);
        }

        let written = match state.file.as_mut() {
            Some(file) => file.write_all(line.as_bytes()),
            None => return Ok(()),
        };
        if let Err(e) = written {
            // Reopen on the next record.
            state.file = None;
            return Err(DaqError::Persistence(format!(
                "write to {} failed: {}",
                self.path_for(day).display(),
                e
            )));
        }
        Ok(())
    }

    fn open(&self, day: NaiveDate) -> AppResult<LineWriter<File>> {
        let dir = self.dir_for(day);
        let path = dir.join(&self.file_name);
        fs::create_dir_all(&dir).map_err(|e| {
            DaqError::Persistence(format!("cannot create {}: {}", dir.display(), e))
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DaqError::Persistence(format!("cannot open {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Opened sensor log");

        if let Some(alias) = &self.alias_name {
            link_alias(&dir, &self.file_name, alias);
        }
        Ok(LineWriter::new(file))
    }
}

impl Logger for DateShardedLog {
    fn log(&self, record: &LogRecord<'_>) -> AppResult<()> {
        self.log_on(record, Local::now().date_naive())
    }
}

#[cfg(unix)]
fn link_alias(dir: &Path, target: &str, alias: &str) {
    let link = dir.join(alias);
    if link.symlink_metadata().is_ok() {
        return;
    }
    if let Err(e) = std::os::unix::fs::symlink(target, &link) {
        warn!(link = %link.display(), error = %e, "Could not create alias link");
    }
}

#[cfg(not(unix))]
fn link_alias(_dir: &Path, _target: &str, _alias: &str) {}

/// NaN-ignoring mean for small windows, median from [`MEDIAN_THRESHOLD`] samples.
pub fn aggregate(values: &[f64]) -> f64 {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    if values.len() < MEDIAN_THRESHOLD {
        return finite.iter().sum::<f64>() / finite.len() as f64;
    }
    finite.sort_by(f64::total_cmp);
    let mid = finite.len() / 2;
    if finite.len() % 2 == 0 {
        (finite[mid - 1] + finite[mid]) / 2.0
    } else {
        finite[mid]
    }
}
