//! Custom error types for the daemon.
//!
//! `DaqError` is the single error type of the library. Using `thiserror`, it keeps
//! the failure categories of the housekeeping daemon in one place:
//!
//! - **`Config`**: wraps errors from `figment` while layering the settings sources.
//! - **`Configuration`**: semantic errors in user-authored configuration (duplicate
//!   channel ids, wrong channel count, unknown calibration). These are fatal at
//!   startup.
//! - **`Io`**: wraps `std::io::Error` for file and socket failures.
//! - **`Instrument`**: faults reported by a device or its link.
//! - **`Persistence`**: a logger could not write its output. Callers log these and
//!   keep acquiring.
//! - **`SerialFeatureDisabled`**: a serial device was configured in a build without
//!   the `instrument_serial` feature.
//!
//! With `#[from]`, lower level errors convert through the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be extracted from the layered sources.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device-level failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// An operation needed an open serial link and there was none.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// The link reported end of stream.
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// A logger failed to persist a record.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// One or more components failed to close cleanly.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("LS336 did not answer".to_string());
        assert_eq!(err.to_string(), "Instrument error: LS336 did not answer");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Instrument("heater link timeout".into()),
            DaqError::Persistence("disk full".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }

    #[test]
    fn test_io_conversion() {
        fn open_missing() -> AppResult<()> {
            std::fs::File::open("/nonexistent/hk/file")?;
            Ok(())
        }
        assert!(matches!(open_missing(), Err(DaqError::Io(_))));
    }
}
