//! Housekeeping data acquisition for cryostats.
//!
//! The daemon polls serial and GPIB instruments, turns their answers into sensor
//! values, logs them to date-sharded text files and frame-aligned blocks, and
//! accepts target changes over a loopback command port.
//!
//! - [`hardware`]: framed, self-reconnecting serial transports and the GPIB bus
//! - [`instrument`]: device dialects, channel banks and output control
//! - [`sensor`]: sensors, sensor types and the shared target registry
//! - [`data`]: loggers
//! - [`network`]: the command listener and client
//! - [`app`]: the plant, the control loop and daemon assembly

pub mod app;
pub mod calibration;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod instrument;
pub mod network;
pub mod sensor;
