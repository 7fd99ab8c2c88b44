//! Lakeshore 336 temperature controller driver
//!
//! Four thermometer inputs (`A`..`D`) and two heater outputs (`I1`, `I2`). The
//! controller is reached either over its own RS-232 port or through a Prologix GPIB
//! adapter when `gpib_address` is set.
//!
//! ## Configuration
//!
//! ```json
//! {"type": "ls336", "port": "/dev/serial/by-id/usb-LSCI_336", "wait_time": 8,
//!  "channels": [{"name": "T_mc"}, {"name": "T_still"}, {"name": "T_4k"},
//!               {"name": "T_50k"}, {"name": "H_sorb"}, {"name": "H_switch"}]}
//! ```
//!
//! Heater channels default to `percentage`, `state` and their targets. A state
//! target selects the output range (`RANGE`), a percentage target the manual output
//! (`MOUT`); each is sent once and then cleared.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::channels::{
    ChannelConfig, ChannelDefaults, ChannelId, IdScheme, SensorBank, TypeSpec,
};
use super::scpi::{PollAction, ScpiSession};
use super::{wait_time, BuildContext, Instrument, Reading, ReadingSender, UpdateCadence};
use crate::data::format::format_g;
use crate::data::{unix_now, Logger};
use crate::error::AppResult;
use crate::hardware::{
    FrameChannel, FramedTransport, FramingConfig, GpibAddress, SerialParity, SerialPortConfig,
};
use crate::sensor::{Quantity, SensorType, TargetKind, TargetRegistry};

/// Substring the `*IDN?` answer must contain.
pub const IDN: &str = "MODEL336";

/// Thermometer input labels.
pub const THERMOMETER_IDS: [&str; 4] = ["A", "B", "C", "D"];

/// Heater output labels.
pub const HEATER_IDS: [&str; 2] = ["I1", "I2"];

const CHANNEL_IDS: [&str; 6] = ["A", "B", "C", "D", "I1", "I2"];

const HEATER_TYPES: [&str; 4] = ["percentage", "state", "starg", "percenttarg"];

const PERCENTAGE: SensorType = SensorType::Measured(Quantity::Percentage);
const STATE: SensorType = SensorType::Measured(Quantity::State);

fn default_wait_time() -> f64 {
    8.0
}

fn default_baudrate() -> u32 {
    57_600
}

/// Hardware-file entry of a Lakeshore 336.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ls336Config {
    /// Serial port of the controller, or of the GPIB adapter.
    pub port: String,
    /// Six channels: `A`..`D`, `I1`, `I2`.
    pub channels: Vec<ChannelConfig>,
    /// Seconds between polls.
    #[serde(default = "default_wait_time")]
    pub wait_time: f64,
    /// Baud rate of a direct serial connection.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Address on a GPIB bus; direct serial when absent.
    #[serde(default)]
    pub gpib_address: Option<u8>,
}

/// A Lakeshore 336.
pub struct Lakeshore336 {
    session: ScpiSession,
    bank: SensorBank,
    cadence: UpdateCadence,
    readings_tx: ReadingSender,
    readings: mpsc::UnboundedReceiver<Reading>,
    transport: Option<Arc<FramedTransport>>,
}

impl Lakeshore336 {
    /// Validate the configuration and open the serial or GPIB link.
    pub fn open(config: Ls336Config, ctx: &BuildContext) -> AppResult<Self> {
        let bank = build_bank(&config, ctx)?;
        let wait = wait_time(config.wait_time)?;

        let (channel, transport, cadence) = match config.gpib_address {
            Some(address) => {
                let bus = ctx.gpib_bus(&config.port)?;
                let address = GpibAddress::new(address)?;
                let device: Arc<dyn FrameChannel> = Arc::new(bus.device(address));
                let cadence = UpdateCadence::new(wait).with_random_phase();
                (device, bus.transport().clone(), cadence)
            }
            None => {
                let port = SerialPortConfig::new(config.port.as_str(), config.baudrate)
                    .with_format(7, SerialParity::Odd, 1);
                let transport = ctx.serial_transport(port, FramingConfig::text("\r\n"))?;
                let channel: Arc<dyn FrameChannel> = transport.clone();
                (channel, transport, UpdateCadence::new(wait))
            }
        };

        let mut instrument = Self::assemble(bank, cadence, channel, ctx);
        instrument.transport = Some(transport);
        Ok(instrument)
    }

    /// Build over an already open channel.
    pub fn with_channel(
        config: &Ls336Config,
        channel: Arc<dyn FrameChannel>,
        ctx: &BuildContext,
    ) -> AppResult<Self> {
        let bank = build_bank(config, ctx)?;
        let cadence = UpdateCadence::new(wait_time(config.wait_time)?);
        Ok(Self::assemble(bank, cadence, channel, ctx))
    }

    fn assemble(
        bank: SensorBank,
        cadence: UpdateCadence,
        channel: Arc<dyn FrameChannel>,
        ctx: &BuildContext,
    ) -> Self {
        let (readings_tx, readings) = mpsc::unbounded_channel();
        Self {
            session: ScpiSession::new("LS336", IDN, channel, ctx.scpi.clone()),
            bank,
            cadence,
            readings_tx,
            readings,
            transport: None,
        }
    }

    fn apply_readings(&mut self) {
        while let Ok(reading) = self.readings.try_recv() {
            let value = match self.bank.channel(&reading.channel) {
                Some(channel) if reading.sensor_type == SensorType::TEMPERATURE => {
                    channel.calibration.apply(reading.value)
                }
                _ => reading.value,
            };
            self.bank
                .set(&reading.channel, reading.sensor_type, value, Some(reading.timestamp));
        }
    }

    fn request_readings(&self) {
        let tx = self.readings_tx.clone();
        self.session.ask("KRDG? 0", move |answer| {
            let Some(values) = parse_temperatures(&answer) else {
                error!(received = %answer, "Error loading in Lakeshore 336 temperatures");
                return;
            };
            let timestamp = unix_now();
            for (label, value) in THERMOMETER_IDS.iter().zip(values) {
                let _ = tx.send(Reading {
                    channel: ChannelId::from(*label),
                    sensor_type: SensorType::TEMPERATURE,
                    value,
                    timestamp,
                });
            }
        });

        for (index, label) in HEATER_IDS.iter().enumerate() {
            self.ask_heater(format!("MOUT? {}", index + 1), *label, PERCENTAGE);
            self.ask_heater(format!("RANGE? {}", index + 1), *label, STATE);
        }
    }

    fn ask_heater(&self, query: String, label: &'static str, sensor_type: SensorType) {
        let tx = self.readings_tx.clone();
        self.session.ask(&query, move |answer| match answer.parse::<f64>() {
            Ok(value) => {
                let _ = tx.send(Reading {
                    channel: ChannelId::from(label),
                    sensor_type,
                    value,
                    timestamp: unix_now(),
                });
            }
            Err(_) => error!(
                heater = label,
                received = %answer,
                "Error loading in Lakeshore 336 heater parameter"
            ),
        });
    }

    fn process_targets(&self, targets: &mut TargetRegistry) {
        for (index, label) in HEATER_IDS.iter().enumerate() {
            let id = ChannelId::from(*label);
            let output = index + 1;
            let pairs = [(TargetKind::State, STATE), (TargetKind::Percentage, PERCENTAGE)];
            for (kind, measured) in pairs {
                let Some(target) = self.bank.target_mut(targets, &id, kind) else {
                    continue;
                };
                let wanted = target.value();
                if !wanted.is_finite() || wanted == self.bank.value(&id, measured) {
                    continue;
                }
                let command = match kind {
                    TargetKind::State => format!("RANGE {} {}", output, wanted as i64),
                    _ => format!("MOUT {} {}", output, format_g(wanted, 6)),
                };
                debug!(output, command = %command, "Requesting Lakeshore 336 output change");
                self.session.send(&command);
                // Sent once; a rejected request is not retried.
                target.clear();
            }
        }
    }
}

fn build_bank(config: &Ls336Config, ctx: &BuildContext) -> AppResult<SensorBank> {
    let channels: Vec<ChannelConfig> = config
        .channels
        .iter()
        .enumerate()
        .map(|(position, channel)| {
            let label = match &channel.id {
                Some(ChannelId::Key(key)) => Some(key.as_str()),
                Some(ChannelId::Index(_)) => None,
                None => CHANNEL_IDS.get(position).copied(),
            };
            let mut channel = channel.clone();
            if channel.types.is_none() && label.is_some_and(|l| HEATER_IDS.contains(&l)) {
                channel.types = Some(TypeSpec::Many(
                    HEATER_TYPES.iter().map(|t| t.to_string()).collect(),
                ));
            }
            channel
        })
        .collect();

    SensorBank::build(
        "LS336",
        &channels,
        Some(CHANNEL_IDS.len()),
        IdScheme::Labels(&CHANNEL_IDS),
        &ChannelDefaults::new("temperature"),
        &ctx.bank_context(),
    )
}

/// Parse the four comma-separated kelvin readings of `KRDG? 0`.
fn parse_temperatures(answer: &str) -> Option<[f64; 4]> {
    let parts: Vec<&str> = answer.trim_end().split(',').collect();
    if parts.len() != THERMOMETER_IDS.len() {
        return None;
    }
    let mut values = [f64::NAN; 4];
    for (slot, part) in values.iter_mut().zip(parts) {
        *slot = part.trim().parse().ok()?;
    }
    Some(values)
}

#[async_trait]
impl Instrument for Lakeshore336 {
    fn kind(&self) -> &'static str {
        "ls336"
    }

    fn channel_names(&self) -> Vec<String> {
        self.bank.channel_names()
    }

    fn add_logger(&mut self, logger: Arc<dyn Logger>) {
        self.bank.add_logger(logger);
    }

    fn connect_targets(&mut self, targets: &mut TargetRegistry) -> AppResult<()> {
        self.bank.connect_targets(targets)
    }

    fn update(&mut self, targets: &mut TargetRegistry) {
        self.apply_readings();
        if !self.cadence.due() {
            return;
        }
        if self.session.poll() == PollAction::RequestData {
            self.request_readings();
            self.process_targets(targets);
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRegistry;
    use crate::hardware::{Frame, ResponseHandler, TransportTiming};
    use crate::instrument::ScpiTiming;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        handlers: Mutex<Vec<ResponseHandler>>,
    }

    impl Recorder {
        fn take_sent(&self) -> Vec<String> {
            std::mem::take(&mut *self.sent.lock().expect("lock"))
        }

        fn answer_all(&self, answers: &[&str]) {
            let handlers: Vec<ResponseHandler> =
                std::mem::take(&mut *self.handlers.lock().expect("lock"));
            assert_eq!(handlers.len(), answers.len());
            for (handler, answer) in handlers.into_iter().zip(answers) {
                handler(Frame::Text(answer.to_string()));
            }
        }
    }

    impl FrameChannel for Recorder {
        fn send_frame(&self, payload: &[u8], handler: Option<ResponseHandler>) {
            self.sent
                .lock()
                .expect("lock")
                .push(String::from_utf8_lossy(payload).into_owned());
            if let Some(h) = handler {
                self.handlers.lock().expect("lock").push(h);
            }
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "recorder".into()
        }
    }

    fn config() -> Ls336Config {
        serde_json::from_value(serde_json::json!({
            "port": "/dev/serial/by-id/usb-LSCI_336",
            "wait_time": 0,
            "channels": [
                {"name": "T_mc"}, {"name": "T_still"}, {"name": "T_4k"},
                {"name": "T_50k"}, {"name": "H_sorb"}, {"name": "H_switch"}
            ]
        }))
        .expect("config")
    }

    fn context() -> BuildContext {
        BuildContext::new(
            None,
            TransportTiming::default(),
            ScpiTiming::default(),
            CalibrationRegistry::new(),
        )
    }

    fn instrument(recorder: &Arc<Recorder>) -> Lakeshore336 {
        let ls = Lakeshore336::with_channel(&config(), recorder.clone(), &context())
            .expect("ls336");
        recorder.answer_all(&["LSCI,MODEL336,LSA1234/#######,2.9"]);
        recorder.take_sent();
        ls
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.baudrate, 57_600);
        assert_eq!(config.gpib_address, None);
        assert!(Lakeshore336::with_channel(
            &Ls336Config {
                channels: config.channels[..5].to_vec(),
                ..config.clone()
            },
            Arc::new(Recorder::default()),
            &context(),
        )
        .is_err());
    }

    #[test]
    fn test_poll_queries_and_applies_readings() {
        let recorder = Arc::new(Recorder::default());
        let mut ls = instrument(&recorder);
        let mut targets = TargetRegistry::new();
        ls.connect_targets(&mut targets).expect("targets");

        ls.update(&mut targets);
        assert_eq!(
            recorder.take_sent(),
            vec!["KRDG? 0", "MOUT? 1", "RANGE? 1", "MOUT? 2", "RANGE? 2"]
        );
        recorder.answer_all(&["+0.0120,+0.8000,+4.2000,+51.000", "12.5", "3", "0.0", "0"]);

        ls.update(&mut targets);
        assert_eq!(ls.bank.value(&"A".into(), SensorType::TEMPERATURE), 0.012);
        assert_eq!(ls.bank.value(&"D".into(), SensorType::TEMPERATURE), 51.0);
        assert_eq!(ls.bank.value(&"I1".into(), PERCENTAGE), 12.5);
        assert_eq!(ls.bank.value(&"I1".into(), STATE), 3.0);
    }

    #[test]
    fn test_targets_sent_once_then_cleared() {
        let recorder = Arc::new(Recorder::default());
        let mut ls = instrument(&recorder);
        let mut targets = TargetRegistry::new();
        ls.connect_targets(&mut targets).expect("targets");

        assert!(targets.set_target(TargetKind::State, "H_sorb", 2.0));
        assert!(targets.set_target(TargetKind::Percentage, "H_switch", 37.5));
        ls.update(&mut targets);

        let sent = recorder.take_sent();
        assert!(sent.contains(&"RANGE 1 2".to_string()));
        assert!(sent.contains(&"MOUT 2 37.5".to_string()));
        assert!(targets
            .find_mut(TargetKind::State, "H_sorb")
            .is_some_and(|s| s.value().is_nan()));

        recorder.answer_all(&["1,2,3,4", "0", "0", "0", "0"]);
        ls.update(&mut targets);
        let sent = recorder.take_sent();
        assert!(!sent.iter().any(|s| s.starts_with("RANGE 1") || s.starts_with("MOUT 2 ")));
    }

    #[test]
    #[traced_test]
    fn test_malformed_temperatures_rejected() {
        let recorder = Arc::new(Recorder::default());
        let mut ls = instrument(&recorder);
        let mut targets = TargetRegistry::new();
        ls.update(&mut targets);
        recorder.answer_all(&["+4.2,+4.3", "1", "1", "1", "1"]);
        ls.update(&mut targets);
        assert!(ls.bank.value(&"A".into(), SensorType::TEMPERATURE).is_nan());
        assert!(logs_contain("Error loading in Lakeshore 336 temperatures"));
    }

    #[test]
    fn test_parse_temperatures() {
        assert_eq!(
            parse_temperatures("+1.0,+2.0,+3.0,+4.0\r\n"),
            Some([1.0, 2.0, 3.0, 4.0])
        );
        assert_eq!(parse_temperatures("1,2,x,4"), None);
    }
}
