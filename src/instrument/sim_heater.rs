//! Simulated heater bank for bench runs and tests.
//!
//! Every channel is a resistive heater bolted to its own thermal mass. Applied
//! voltage heats the stage; it relaxes towards `ambient` through a fixed thermal
//! conductance. Temperature targets close a proportional loop on the heater voltage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info};

use super::channels::{ChannelConfig, ChannelDefaults, ChannelId, IdScheme, SensorBank};
use super::output::{voltage_to_power, OutputControl, OutputDriver, OutputLimits};
use super::{wait_time, BuildContext, Instrument, UpdateCadence};
use crate::data::{unix_now, Logger};
use crate::error::{AppResult, DaqError};
use crate::sensor::{Quantity, SensorType, TargetRegistry};

fn default_wait_time() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_max_voltage() -> f64 {
    10.0
}

fn default_ambient() -> f64 {
    4.0
}

fn default_heat_capacity() -> f64 {
    1.0
}

fn default_conductance() -> f64 {
    0.05
}

fn default_gain() -> f64 {
    1.0
}

/// Hardware-file entry of a simulated heater bank.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimHeaterConfig {
    /// Heater channels.
    pub channels: Vec<ChannelConfig>,
    /// Seconds between simulation steps.
    #[serde(default = "default_wait_time")]
    pub wait_time: f64,
    /// Highest voltage the output accepts.
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    /// Lowest voltage the output accepts.
    #[serde(default)]
    pub min_voltage: f64,
    /// Accept power targets.
    #[serde(default = "default_true")]
    pub can_set_power: bool,
    /// Accept temperature targets.
    #[serde(default = "default_true")]
    pub can_set_temperature: bool,
    /// Bath temperature, kelvin.
    #[serde(default = "default_ambient")]
    pub ambient: f64,
    /// Heat capacity of each stage, J/K.
    #[serde(default = "default_heat_capacity")]
    pub heat_capacity: f64,
    /// Thermal link to the bath, W/K.
    #[serde(default = "default_conductance")]
    pub conductance: f64,
    /// Proportional gain of the temperature loop, V/K.
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Peak uniform thermometer noise, kelvin.
    #[serde(default)]
    pub noise: f64,
}

impl SimHeaterConfig {
    fn validate(&self) -> AppResult<()> {
        let positive = [
            ("heat_capacity", self.heat_capacity),
            ("conductance", self.conductance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "sim_heater: {} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.noise.is_finite() && self.noise >= 0.0) {
            return Err(DaqError::Configuration(format!(
                "sim_heater: noise must be non-negative, got {}",
                self.noise
            )));
        }
        if !(self.min_voltage <= self.max_voltage) {
            return Err(DaqError::Configuration(format!(
                "sim_heater: min_voltage {} exceeds max_voltage {}",
                self.min_voltage, self.max_voltage
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Stage {
    volts: f64,
    kelvin: f64,
    setpoint: Option<f64>,
}

/// Applied outputs, as seen through [`OutputDriver`].
#[derive(Debug, Default)]
struct Stages(HashMap<ChannelId, Stage>);

impl OutputDriver for Stages {
    fn set_voltage(&mut self, channel: &ChannelId, volts: f64) {
        if let Some(stage) = self.0.get_mut(channel) {
            debug!(channel = %channel, volts, "Simulated heater voltage");
            stage.volts = volts;
        }
    }

    fn set_temperature(&mut self, channel: &ChannelId, kelvin: Option<f64>) {
        if let Some(stage) = self.0.get_mut(channel) {
            debug!(channel = %channel, setpoint = ?kelvin, "Simulated heater setpoint");
            stage.setpoint = kelvin;
        }
    }
}

/// Simulated heater bank.
pub struct SimHeater {
    config: SimHeaterConfig,
    bank: SensorBank,
    output: OutputControl,
    stages: Stages,
    cadence: UpdateCadence,
    last_step: Instant,
}

impl SimHeater {
    /// Build the bank; every stage starts at ambient with the heater off.
    pub fn new(config: SimHeaterConfig, ctx: &BuildContext) -> AppResult<Self> {
        config.validate()?;
        let cadence = UpdateCadence::new(wait_time(config.wait_time)?);
        let bank = SensorBank::build(
            "sim_heater",
            &config.channels,
            None,
            IdScheme::Positional,
            &ChannelDefaults::new("heater:setpt:imon"),
            &ctx.bank_context(),
        )?;
        let stages = bank
            .channels()
            .iter()
            .map(|c| {
                let stage = Stage {
                    volts: 0.0,
                    kelvin: config.ambient,
                    setpoint: None,
                };
                (c.id.clone(), stage)
            })
            .collect();
        let output = OutputControl::new(OutputLimits {
            max_voltage: config.max_voltage,
            min_voltage: config.min_voltage,
            can_set_power: config.can_set_power,
            can_set_temperature: config.can_set_temperature,
        });
        info!(channels = bank.channels().len(), "Simulated heater bank ready");
        Ok(Self {
            config,
            bank,
            output,
            stages: Stages(stages),
            cadence,
            last_step: Instant::now(),
        })
    }

    /// Advance the thermal model by `dt` seconds.
    fn step(&mut self, dt: f64) {
        let config = &self.config;
        for channel in self.bank.channels() {
            let Some(stage) = self.stages.0.get_mut(&channel.id) else {
                continue;
            };
            if let Some(setpoint) = stage.setpoint {
                stage.volts = (config.gain * (setpoint - stage.kelvin))
                    .clamp(config.min_voltage, config.max_voltage);
            }
            let heating = voltage_to_power(channel, stage.volts);
            let cooling = config.conductance * (stage.kelvin - config.ambient);
            stage.kelvin += (heating - cooling) / config.heat_capacity * dt;
        }
    }

    /// Publish the state of every stage to its sensors.
    fn publish(&mut self) {
        let timestamp = Some(unix_now());
        let noise = self.config.noise;
        let mut rng = rand::thread_rng();
        let channels: Vec<_> = self
            .bank
            .channels()
            .iter()
            .map(|c| {
                let watts_per_volt2 = voltage_to_power(c, 1.0);
                (c.id.clone(), c.config.r_total, watts_per_volt2, c.types.clone())
            })
            .collect();

        for (id, r_total, watts_per_volt2, types) in channels {
            let Some(stage) = self.stages.0.get(&id).copied() else {
                continue;
            };
            let measured_kelvin = if noise > 0.0 {
                stage.kelvin + rng.gen_range(-noise..=noise)
            } else {
                stage.kelvin
            };
            let current = r_total.map_or(f64::NAN, |r| stage.volts / r);
            let readings = [
                (Quantity::Voltage, stage.volts),
                (Quantity::Current, current),
                (Quantity::Power, watts_per_volt2 * stage.volts * stage.volts),
                (Quantity::Temperature, measured_kelvin),
            ];
            for (quantity, value) in readings {
                let sensor_type = SensorType::Measured(quantity);
                if types.contains(&sensor_type) {
                    self.bank.set(&id, sensor_type, value, timestamp);
                }
            }
        }
    }
}

#[async_trait]
impl Instrument for SimHeater {
    fn kind(&self) -> &'static str {
        "sim_heater"
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
        if !self.cadence.due() {
            return;
        }
        let now = Instant::now();
        let dt = now.saturating_duration_since(self.last_step).as_secs_f64();
        self.last_step = now;

        self.output.process(&self.bank, targets, &mut self.stages);
        self.step(dt);
        self.publish();
    }

    async fn close(&mut self) -> AppResult<()> {
        for stage in self.stages.0.values_mut() {
            stage.volts = 0.0;
            stage.setpoint = None;
        }
        info!("Simulated heater bank closed");
        Ok(())
    }
}
