//! Physical byte links and how to open them.
//!
//! The transport only needs an async byte stream. Real serial ports come from
//! `tokio-serial` when the `instrument_serial` feature is enabled; without it,
//! opening a serial link reports [`DaqError::SerialFeatureDisabled`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crate::error::{AppResult, DaqError};

/// An open bidirectional byte stream.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {
    /// Bytes received by the driver but not yet read. Zero when unknown.
    fn bytes_waiting(&self) -> usize {
        0
    }
}

/// Produces fresh links for a transport. Called again after every link failure.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Human-readable port identity for logs.
    fn describe(&self) -> String;

    /// Open a new link.
    async fn open(&self) -> AppResult<Box<dyn Link>>;
}

/// Parity modes for serial communication
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Configuration for a serial port connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialPortConfig {
    /// Path to the serial device (e.g., "/dev/serial/by-id/usb-FTDI_...")
    pub path: String,
    /// Baud rate (9600, 57600, etc.)
    pub baud_rate: u32,
    /// Data bits (7 or 8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity setting
    pub parity: SerialParity,
    /// Driver-level timeout
    pub timeout: Duration,
}

impl Default for SerialPortConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            timeout: Duration::from_millis(10),
        }
    }
}

impl SerialPortConfig {
    /// 8N1 at the given rate.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            ..Self::default()
        }
    }

    /// Override framing bits.
    pub fn with_format(mut self, data_bits: u8, parity: SerialParity, stop_bits: u8) -> Self {
        self.data_bits = data_bits;
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }

    /// Reject impossible settings before the first open.
    pub fn validate(&self) -> AppResult<()> {
        if self.path.is_empty() {
            return Err(DaqError::Configuration("Serial port path is empty".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(DaqError::Configuration(format!(
                "Unsupported data bits {} on {}",
                self.data_bits, self.path
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(DaqError::Configuration(format!(
                "Unsupported stop bits {} on {}",
                self.stop_bits, self.path
            )));
        }
        Ok(())
    }
}

/// Generic USB serial names are assigned in enumeration order and may swap between
/// boots; stable names live under `/dev/serial/by-id`.
fn is_unstable_name(path: &str) -> bool {
    ["/dev/ttyUSB", "/dev/ttyACM"]
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Opens a serial port.
#[derive(Debug, Clone)]
pub struct SerialLinkOpener {
    config: SerialPortConfig,
}

impl SerialLinkOpener {
    /// Opener for the given port settings.
    pub fn new(config: SerialPortConfig) -> AppResult<Self> {
        config.validate()?;
        if is_unstable_name(&config.path) {
            warn!(
                port = %config.path,
                "Generic serial device name may change between reboots; prefer /dev/serial/by-id"
            );
        }
        Ok(Self { config })
    }

    /// Port settings.
    pub fn config(&self) -> &SerialPortConfig {
        &self.config
    }
}

#[cfg(feature = "instrument_serial")]
impl Link for tokio_serial::SerialStream {
    fn bytes_waiting(&self) -> usize {
        use tokio_serial::SerialPort;
        self.bytes_to_read().map_or(0, |n| n as usize)
    }
}

#[async_trait]
impl LinkOpener for SerialLinkOpener {
    fn describe(&self) -> String {
        self.config.path.clone()
    }

    #[cfg(feature = "instrument_serial")]
    async fn open(&self) -> AppResult<Box<dyn Link>> {
        use tokio_serial::SerialPortBuilderExt;

        let data_bits = match self.config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match self.config.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Even => tokio_serial::Parity::Even,
            SerialParity::Odd => tokio_serial::Parity::Odd,
        };

        let stream = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(self.config.timeout)
            .open_native_async()
            .map_err(|e| {
                DaqError::Instrument(format!(
                    "Failed to open serial port '{}': {}",
                    self.config.path, e
                ))
            })?;
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn open(&self) -> AppResult<Box<dyn Link>> {
        Err(DaqError::SerialFeatureDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SerialPortConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.parity, SerialParity::None);
    }

    #[test]
    fn test_validate_rejects_bad_format() {
        assert!(SerialPortConfig::default().validate().is_err());
        let config = SerialPortConfig::new("/dev/serial/by-id/ls336", 57600).with_format(
            9,
            SerialParity::Odd,
            1,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unstable_names() {
        assert!(is_unstable_name("/dev/ttyUSB0"));
        assert!(!is_unstable_name("/dev/serial/by-id/usb-FTDI_123"));
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[tokio::test]
    async fn test_open_without_feature() {
        let opener = SerialLinkOpener::new(SerialPortConfig::new("/dev/serial/by-id/x", 9600))
            .expect("valid config");
        assert!(matches!(
            opener.open().await,
            Err(DaqError::SerialFeatureDisabled)
        ));
    }
}
