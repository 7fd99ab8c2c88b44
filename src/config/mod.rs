//! Configuration documents.
//!
//! [`Settings`] tune the daemon itself and are layered with figment;
//! [`HardwareConfig`] lists the devices to poll. Both are loaded once at startup
//! and handed down explicitly.

pub mod hardware;
pub mod settings;

pub use hardware::HardwareConfig;
pub use settings::{
    ApplicationSettings, CommandServerSettings, ControlLoopSettings, Settings, StorageSettings,
};
