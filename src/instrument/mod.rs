//! Instruments and the pieces they are assembled from.
//!
//! An instrument owns a [`SensorBank`](channels::SensorBank), talks to its hardware
//! through a [`FrameChannel`](crate::hardware::FrameChannel) and is driven by the
//! control loop through [`Instrument::update`]. Response handlers run on the
//! transport's dispatch task; they only forward [`Reading`]s over a channel, and the
//! instrument applies them to its sensors in `update`, while the plant lock is held.
//!
//! ## Configuration
//!
//! Devices are described in the hardware file, one entry per device:
//!
//! ```json
//! [
//!   {"type": "ls336", "port": "/dev/serial/by-id/usb-LSCI_336", "wait_time": 8,
//!    "channels": [{"name": "T_mc"}, {"name": "T_still"}, {"name": "T_4k"},
//!                 {"name": "T_50k"}, {"name": "H_sorb"}, {"name": "H_switch"}]},
//!   {"type": "sim_heater", "channels": [{"name": "H_sim", "r_total": 200, "r_heater": 100}]}
//! ]
//! ```

pub mod channels;
pub mod lakeshore_336;
pub mod output;
pub mod scpi;
pub mod sim_heater;

pub use channels::{ChannelConfig, ChannelId, SensorBank};
pub use lakeshore_336::{Lakeshore336, Ls336Config};
pub use output::{OutputControl, OutputDriver, OutputLimits, OutputMode};
pub use scpi::{ScpiSession, ScpiTiming};
pub use sim_heater::{SimHeater, SimHeaterConfig};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::calibration::CalibrationRegistry;
use crate::data::Logger;
use crate::error::{AppResult, DaqError};
use crate::hardware::{
    Frame, FramedTransport, FramingConfig, GpibBus, SerialLinkOpener, SerialPortConfig,
    TransportTiming,
};
use crate::sensor::{SensorType, TargetRegistry};
use channels::BankContext;

/// A device the control loop polls.
///
/// All methods except `close` are called with the plant lock held and must not
/// block.
#[async_trait]
pub trait Instrument: Send {
    /// Device type tag, as used in the hardware file.
    fn kind(&self) -> &'static str;

    /// Names of all channels, for the global uniqueness check.
    fn channel_names(&self) -> Vec<String>;

    /// Attach a logger to every sensor.
    fn add_logger(&mut self, logger: Arc<dyn Logger>);

    /// Move target sensors into the shared registry.
    fn connect_targets(&mut self, targets: &mut TargetRegistry) -> AppResult<()>;

    /// Apply pending readings, poll the hardware if due and act on targets.
    fn update(&mut self, targets: &mut TargetRegistry);

    /// Release the hardware.
    async fn close(&mut self) -> AppResult<()>;
}

/// One value produced by a response handler, waiting to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Channel the value belongs to.
    pub channel: ChannelId,
    /// Sensor it updates.
    pub sensor_type: SensorType,
    /// Raw value.
    pub value: f64,
    /// Seconds since the Unix epoch when it arrived.
    pub timestamp: f64,
}

/// Sending half for readings, cloned into response handlers.
pub type ReadingSender = mpsc::UnboundedSender<Reading>;

/// Rate limit on an instrument's periodic work.
#[derive(Debug, Clone)]
pub struct UpdateCadence {
    wait: Duration,
    next: Instant,
}

impl UpdateCadence {
    /// First run one `wait` from now.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            next: Instant::now() + wait,
        }
    }

    /// Push the first run back by a random fraction of `wait`, so devices that
    /// share a bus do not all ask at once.
    pub fn with_random_phase(mut self) -> Self {
        let phase: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.next += self.wait.mul_f64(phase);
        self
    }

    /// Interval between runs.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// True (and rearms) when a run is due.
    pub fn due(&mut self) -> bool {
        self.due_at(Instant::now())
    }

    /// [`Self::due`] against an explicit clock.
    pub fn due_at(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.wait;
        true
    }
}

/// Parse a `wait_time` given in seconds.
pub fn wait_time(seconds: f64) -> AppResult<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        DaqError::Configuration(format!("wait_time should be a positive number, got {}", seconds))
    })
}

/// One entry of the hardware description.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    /// Lakeshore 336 temperature controller.
    Ls336(Ls336Config),
    /// Simulated heater bank.
    SimHeater(SimHeaterConfig),
}

/// Controller baud rate for Prologix-style GPIB adapters.
pub const GPIB_CONTROLLER_BAUD: u32 = 115_200;

/// Everything instrument construction needs besides its own configuration.
pub struct BuildContext {
    /// Root of the date-sharded logs; `None` disables them.
    pub data_dir: Option<PathBuf>,
    /// Timing of every framed transport.
    pub transport: TransportTiming,
    /// Connectivity inference timing of SCPI devices.
    pub scpi: ScpiTiming,
    /// Calibration curves channels may name.
    pub calibrations: CalibrationRegistry,
    buses: Mutex<HashMap<String, GpibBus>>,
}

impl BuildContext {
    /// New context with no GPIB buses opened yet.
    pub fn new(
        data_dir: Option<PathBuf>,
        transport: TransportTiming,
        scpi: ScpiTiming,
        calibrations: CalibrationRegistry,
    ) -> Self {
        Self {
            data_dir,
            transport,
            scpi,
            calibrations,
            buses: Mutex::new(HashMap::new()),
        }
    }

    /// Inputs for [`SensorBank::build`].
    pub fn bank_context(&self) -> BankContext<'_> {
        BankContext {
            calibrations: &self.calibrations,
            log_root: self.data_dir.as_deref(),
        }
    }

    /// Open a serial transport with a handler for unsolicited frames that logs them.
    pub fn serial_transport(
        &self,
        port: SerialPortConfig,
        framing: FramingConfig,
    ) -> AppResult<Arc<FramedTransport>> {
        let opener = Arc::new(SerialLinkOpener::new(port)?);
        let name = opener.config().path.clone();
        let transport = FramedTransport::spawn(
            opener,
            framing,
            self.transport.clone(),
            Arc::new(move |frame: Frame| {
                debug!(port = %name, frame = ?frame, "Unsolicited frame");
            }),
        )?;
        Ok(Arc::new(transport))
    }

    /// The GPIB bus on `port`, opened on first use and shared afterwards.
    pub fn gpib_bus(&self, port: &str) -> AppResult<GpibBus> {
        let mut buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bus) = buses.get(port) {
            return Ok(bus.clone());
        }
        info!(port, "Opening GPIB controller");
        let transport = self.serial_transport(
            SerialPortConfig::new(port, GPIB_CONTROLLER_BAUD),
            FramingConfig::text("\n"),
        )?;
        let bus = GpibBus::new(transport);
        buses.insert(port.to_string(), bus.clone());
        Ok(bus)
    }
}

/// Build an instrument from its hardware-file entry.
pub fn build(config: DeviceConfig, ctx: &BuildContext) -> AppResult<Box<dyn Instrument>> {
    match config {
        DeviceConfig::Ls336(config) => Ok(Box::new(Lakeshore336::open(config, ctx)?)),
        DeviceConfig::SimHeater(config) => Ok(Box::new(SimHeater::new(config, ctx)?)),
    }
}
