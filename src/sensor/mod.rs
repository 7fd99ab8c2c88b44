//! Typed, named sensor values.
//!
//! A [`Sensor`] holds the latest reading of one semantic type for one channel. Every
//! update is optionally smoothed, time stamped and handed to the attached loggers.
//! Measured sensors may carry a derivative child that receives the rate of change.

pub mod kind;
pub mod targets;

pub use kind::{expand_type, Quantity, SensorType, TargetKind};
pub use targets::{TargetHandle, TargetRegistry};

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::data::{unix_now, DateShardedLog, LogRecord, LogValue, Logger};
use crate::error::{AppResult, DaqError};

/// Per-sensor options taken from channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorOptions {
    /// Secondary name for the sensor.
    pub alias: Option<String>,
    /// Raw samples per logged line.
    pub downsample: usize,
    /// Attach a derivative child.
    pub save_derivative: bool,
    /// Also log every raw sample to `<name>.fast` when downsampling.
    pub save_fast: bool,
    /// Exponential filter coefficient in `[0, 1]`; 1 disables filtering.
    pub filter: f64,
}

impl Default for SensorOptions {
    fn default() -> Self {
        Self {
            alias: None,
            downsample: 1,
            save_derivative: false,
            save_fast: false,
            filter: 1.0,
        }
    }
}

/// Latest value of one semantic type on one channel.
pub struct Sensor {
    name: String,
    alias: Option<String>,
    sensor_type: SensorType,
    downsample: usize,
    filter: f64,
    value: f64,
    last_update: f64,
    last_sync: Option<u64>,
    derivative: Option<Box<Sensor>>,
    loggers: Vec<Arc<dyn Logger>>,
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("name", &self.name)
            .field("type", &self.sensor_type)
            .field("value", &self.value)
            .field("last_update", &self.last_update)
            .field("loggers", &self.loggers.len())
            .finish()
    }
}

impl Sensor {
    /// Create a sensor.
    ///
    /// Target types are forced to downsample 1 and no filtering. When `log_root`
    /// is given a date-sharded log is attached (plus the `.fast` and derivative logs
    /// the options ask for).
    pub fn new(
        name: &str,
        sensor_type: SensorType,
        options: &SensorOptions,
        log_root: Option<&Path>,
    ) -> AppResult<Self> {
        if name.is_empty() {
            return Err(DaqError::Configuration("Sensor name must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&options.filter) {
            return Err(DaqError::Configuration(format!(
                "Filter coefficient {} for '{}' is outside [0, 1]",
                options.filter, name
            )));
        }
        if options.downsample == 0 {
            return Err(DaqError::Configuration(format!(
                "Downsample factor for '{}' must be at least 1",
                name
            )));
        }

        let (downsample, filter) = if sensor_type.is_target() {
            (1, 1.0)
        } else {
            (options.downsample, options.filter)
        };

        let mut sensor = Self {
            name: name.to_string(),
            alias: options.alias.clone(),
            sensor_type,
            downsample,
            filter,
            value: f64::NAN,
            last_update: 0.0,
            last_sync: None,
            derivative: None,
            loggers: Vec::new(),
        };

        if let Some(root) = log_root {
            sensor.add_logger(Arc::new(DateShardedLog::new(
                root,
                name,
                sensor_type,
                options.alias.as_deref(),
                downsample,
            )));
            if options.save_fast && downsample > 1 {
                let fast_name = format!("{}.fast", name);
                let fast_alias = options.alias.as_ref().map(|a| format!("{}.fast", a));
                sensor.add_logger(Arc::new(DateShardedLog::new(
                    root,
                    &fast_name,
                    sensor_type,
                    fast_alias.as_deref(),
                    1,
                )));
            }
        }

        if options.save_derivative {
            if let Some(deriv_type) = sensor_type.derivative() {
                let deriv_options = SensorOptions {
                    save_derivative: false,
                    save_fast: false,
                    filter: 1.0,
                    ..options.clone()
                };
                sensor.derivative = Some(Box::new(Sensor::new(
                    name,
                    deriv_type,
                    &deriv_options,
                    log_root,
                )?));
            }
        }
        Ok(sensor)
    }

    /// Sensor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional alias.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Semantic type, fixed at creation.
    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    /// Latest value. NaN when unknown.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Seconds since the epoch of the latest update; 0 before the first one.
    pub fn last_update(&self) -> f64 {
        self.last_update
    }

    /// Sync number of the latest update.
    pub fn last_sync(&self) -> Option<u64> {
        self.last_sync
    }

    /// Raw samples per logged line.
    pub fn downsample(&self) -> usize {
        self.downsample
    }

    /// Derivative child, if configured.
    pub fn derivative(&self) -> Option<&Sensor> {
        self.derivative.as_deref()
    }

    /// Attach a logger. Unused sensors never log.
    pub fn add_logger(&mut self, logger: Arc<dyn Logger>) {
        if self.sensor_type.is_logged() {
            self.loggers.push(logger);
        }
    }

    /// Record a new reading.
    ///
    /// With a filter coefficient below 1 and a finite previous value the stored
    /// value is `(1 - a) * old + a * raw`. `timestamp` defaults to now.
    pub fn set_value(&mut self, raw: f64, timestamp: Option<f64>, sync: Option<u64>) {
        let old_value = self.value;
        let old_time = self.last_update;

        let value = if self.filter < 1.0 && old_value.is_finite() {
            (1.0 - self.filter) * old_value + self.filter * raw
        } else {
            raw
        };
        let timestamp = timestamp.unwrap_or_else(unix_now);

        self.value = value;
        self.last_update = timestamp;
        self.last_sync = sync;
        self.emit(LogValue::Number(value), timestamp, sync);

        if let Some(derivative) = self.derivative.as_mut() {
            let dt = timestamp - old_time;
            if old_time > 0.0 && dt > 0.0 {
                derivative.set_value((value - old_value) / dt, Some(timestamp), sync);
            }
        }
    }

    /// Record a textual reading. The numeric value becomes unknown.
    pub fn set_text(&mut self, text: &str, timestamp: Option<f64>, sync: Option<u64>) {
        let timestamp = timestamp.unwrap_or_else(unix_now);
        self.value = f64::NAN;
        self.last_update = timestamp;
        self.last_sync = sync;
        self.emit(LogValue::Text(text), timestamp, sync);
    }

    /// Mark the value unknown. Used to consume a one-shot target.
    pub fn clear(&mut self) {
        self.set_value(f64::NAN, None, None);
    }

    fn emit(&self, value: LogValue<'_>, timestamp: f64, sync: Option<u64>) {
        let record = LogRecord {
            name: &self.name,
            sensor_type: self.sensor_type,
            value,
            timestamp,
            sync,
        };
        for logger in &self.loggers {
            if let Err(e) = logger.log(&record) {
                warn!(
                    sensor = %self.name,
                    sensor_type = %self.sensor_type,
                    error = %e,
                    "Logger failed"
                );
            }
        }
    }
}
