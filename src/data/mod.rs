//! Persistence of sensor readings.
//!
//! Sensors fan their values out to any number of [`Logger`]s. Two strategies are
//! provided:
//!
//! - [`DateShardedLog`]: one append-only text file per sensor and calendar day,
//!   with optional downsampling.
//! - [`SyncFrameLog`]: a sliding window of frame-aligned readings from many
//!   sensors, flushed to `.npy` blocks.
//!
//! Logger failures are returned to the caller, which logs them and keeps going;
//! a full disk never stalls acquisition.

pub mod date_log;
pub mod format;
pub mod npy;
pub mod sync_frame;

pub use date_log::DateShardedLog;
pub use sync_frame::{SyncFrameConfig, SyncFrameLog};

use crate::error::AppResult;
use crate::sensor::SensorType;

/// Value carried by a log record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogValue<'a> {
    /// Numeric reading. NaN means unknown.
    Number(f64),
    /// Free-form text reading.
    Text(&'a str),
}

/// One reading as handed to a logger.
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    /// Sensor name.
    pub name: &'a str,
    /// Semantic type of the sensor.
    pub sensor_type: SensorType,
    /// The reading.
    pub value: LogValue<'a>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Externally supplied frame counter, if any.
    pub sync: Option<u64>,
}

/// Sink for sensor readings.
///
/// Implementations use interior mutability; a logger may be shared by many sensors.
pub trait Logger: Send + Sync {
    /// Persist one record.
    fn log(&self, record: &LogRecord<'_>) -> AppResult<()>;

    /// Write out anything still buffered. Called once at shutdown.
    fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Current wall-clock time as seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
