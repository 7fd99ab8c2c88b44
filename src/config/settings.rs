//! Daemon settings using Figment
//!
//! Settings are layered from:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `RUST_HKD_`, with `__` between nesting
//!    levels
//!
//! ```text
//! RUST_HKD_APPLICATION__LOG_LEVEL=debug
//! RUST_HKD_STORAGE__DATA_DIR=/tmp/hk
//! RUST_HKD_SERIAL__RECONNECT_INTERVAL=10s
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::data::SyncFrameConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::TransportTiming;
use crate::instrument::ScpiTiming;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RUST_HKD_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level daemon settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Where readings are written
    pub storage: StorageSettings,
    /// Loopback command listener
    pub command_server: CommandServerSettings,
    /// Round-robin timing
    pub control_loop: ControlLoopSettings,
    /// Framed transport timing, shared by every serial device
    pub serial: TransportTiming,
    /// SCPI connectivity inference
    pub scpi: ScpiTiming,
    /// Optional frame-aligned block logger
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_frames: Option<SyncFrameConfig>,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Name used in the startup banner
    pub name: String,
    /// Logging level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "rust_hkd".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root of the date-sharded logs
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/hk"),
        }
    }
}

/// Command listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandServerSettings {
    /// Must be a loopback address
    pub host: IpAddr,
    /// TCP port; 0 picks a free one
    pub port: u16,
}

impl Default for CommandServerSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7945,
        }
    }
}

impl CommandServerSettings {
    /// Socket address to bind.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Control loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopSettings {
    /// An instrument update longer than this is reported
    #[serde(with = "humantime_serde")]
    pub slow_update_warning: Duration,
    /// Sleep after each round
    #[serde(with = "humantime_serde")]
    pub idle_sleep: Duration,
}

impl Default for ControlLoopSettings {
    fn default() -> Self {
        Self {
            slow_update_warning: Duration::from_millis(300),
            idle_sleep: Duration::from_millis(5),
        }
    }
}

impl Settings {
    /// Layered sources, without extracting.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an explicitly named file does not exist, a
    /// source cannot be parsed, or validation fails.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(DaqError::Configuration(format!(
                    "Settings file '{}' not found",
                    path.display()
                )));
            }
        }
        Self::from_figment(Self::figment(path))
    }

    /// Extract and validate settings from any figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Command server host is a loopback address
    /// - Transport read batch is non-zero
    /// - Sync frame logger sizes are non-zero
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if !self.command_server.host.is_loopback() {
            return Err(DaqError::Configuration(format!(
                "Command server host {} is not a loopback address",
                self.command_server.host
            )));
        }

        if self.serial.read_batch == 0 {
            return Err(DaqError::Configuration(
                "serial.read_batch must be at least 1".to_string(),
            ));
        }

        if let Some(sync_frames) = &self.sync_frames {
            sync_frames.validate()?;
        }

        Ok(())
    }
}
