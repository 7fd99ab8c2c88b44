//! Voltage, power and temperature control of heater outputs.
//!
//! An instrument with controllable heater outputs owns an [`OutputControl`] and calls
//! [`OutputControl::process`] every cycle. The component reads the channel's targets,
//! repairs or clamps invalid ones, works out the voltage to apply for the active
//! output mode, and tells the instrument through [`OutputDriver`] only when the
//! output actually needs to change.

use serde::Deserialize;
use tracing::warn;

use super::channels::{Channel, ChannelId, SensorBank};
use crate::sensor::{SensorType, TargetKind, TargetRegistry};

/// Voltage difference below which the output is left alone.
pub const ACCEPTABLE_VOLTAGE_ERROR: f64 = 0.001;

/// Accepted temperature target range, kelvin.
pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 350.0);

/// Control law selected by the `outputmode` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Drive the heater at the voltage target.
    Voltage = 0,
    /// Convert the power target to a voltage through the heater resistances.
    Power = 1,
    /// Hand the temperature target to the instrument's own loop.
    Temperature = 2,
}

impl OutputMode {
    /// Value stored in the `outputmode` target.
    pub fn as_f64(self) -> f64 {
        self as i32 as f64
    }

    /// Decode an `outputmode` target value.
    pub fn from_f64(value: f64) -> Option<Self> {
        match value {
            v if v == 0.0 => Some(OutputMode::Voltage),
            v if v == 1.0 => Some(OutputMode::Power),
            v if v == 2.0 => Some(OutputMode::Temperature),
            _ => None,
        }
    }
}

/// Output capabilities and limits of an instrument.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputLimits {
    /// Highest voltage the output may be set to.
    pub max_voltage: f64,
    /// Lowest voltage the output may be set to.
    pub min_voltage: f64,
    /// Power targets are supported.
    pub can_set_power: bool,
    /// Temperature targets are supported.
    pub can_set_temperature: bool,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_voltage: 10.0,
            min_voltage: 0.0,
            can_set_power: false,
            can_set_temperature: false,
        }
    }
}

/// Hardware side of output control, implemented by the instrument.
pub trait OutputDriver {
    /// Apply a voltage to a channel.
    fn set_voltage(&mut self, channel: &ChannelId, volts: f64);

    /// Start or stop closed-loop temperature control on a channel.
    fn set_temperature(&mut self, _channel: &ChannelId, _kelvin: Option<f64>) {}
}

/// Heater voltage for a power target: `sqrt(P * r_total^2 / r_heater)`.
///
/// Zero when the channel has no resistances configured.
pub fn power_to_voltage(channel: &Channel, power: f64) -> f64 {
    match (channel.config.r_total, channel.config.r_heater) {
        (Some(total), Some(heater)) if heater > 0.0 => (power * total * total / heater).sqrt(),
        _ => 0.0,
    }
}

/// Heater power dissipated at a voltage, the inverse of [`power_to_voltage`].
pub fn voltage_to_power(channel: &Channel, volts: f64) -> f64 {
    match (channel.config.r_total, channel.config.r_heater) {
        (Some(total), Some(heater)) if total > 0.0 => volts * volts * heater / (total * total),
        _ => 0.0,
    }
}

/// Output control component.
#[derive(Debug, Clone)]
pub struct OutputControl {
    limits: OutputLimits,
}

impl OutputControl {
    /// Component with the given limits.
    pub fn new(limits: OutputLimits) -> Self {
        Self { limits }
    }

    /// Configured limits.
    pub fn limits(&self) -> &OutputLimits {
        &self.limits
    }

    /// Reconcile targets with outputs for every channel that has a voltage target.
    ///
    /// Returns true if any output was changed.
    pub fn process(
        &self,
        bank: &SensorBank,
        targets: &mut TargetRegistry,
        driver: &mut dyn OutputDriver,
    ) -> bool {
        let mut changed = false;
        for channel in bank.channels() {
            let id = &channel.id;
            if bank.target_handle(id, TargetKind::Voltage).is_none() {
                continue;
            }
            let measured = bank.value(id, SensorType::VOLTAGE);
            let mode = self.fix_mode(bank, targets, id);

            if self.limits.can_set_temperature {
                let conflicting = match mode {
                    OutputMode::Temperature => TargetKind::Voltage,
                    _ => TargetKind::Temperature,
                };
                if let Some(sensor) = bank.target_mut(targets, id, conflicting) {
                    if sensor.value().is_finite() {
                        sensor.clear();
                        if conflicting == TargetKind::Temperature {
                            driver.set_temperature(id, None);
                        }
                    }
                }
            }

            let volts = match mode {
                OutputMode::Voltage => self.fix_voltage_target(bank, targets, id),
                OutputMode::Power => self
                    .fix_power_target(bank, targets, id)
                    .map(|p| power_to_voltage(channel, p)),
                OutputMode::Temperature => {
                    if let Some(kelvin) = self.fix_temperature_target(bank, targets, id) {
                        if bank.value(id, SensorType::TEMPERATURE) != kelvin {
                            driver.set_temperature(id, Some(kelvin));
                        }
                    }
                    None
                }
            };

            if let Some(volts) = volts {
                if !measured.is_finite() || (measured - volts).abs() > ACCEPTABLE_VOLTAGE_ERROR {
                    driver.set_voltage(id, volts);
                    changed = true;
                }
            }
        }
        changed
    }

    fn fix_mode(
        &self,
        bank: &SensorBank,
        targets: &mut TargetRegistry,
        id: &ChannelId,
    ) -> OutputMode {
        let Some(sensor) = bank.target_mut(targets, id, TargetKind::OutputMode) else {
            return OutputMode::Voltage;
        };
        let raw = sensor.value();
        let mode = OutputMode::from_f64(raw).filter(|m| match m {
            OutputMode::Voltage => true,
            OutputMode::Power => self.limits.can_set_power,
            OutputMode::Temperature => self.limits.can_set_temperature,
        });
        match mode {
            Some(mode) => mode,
            None => {
                if !raw.is_nan() {
                    warn!(channel = %id, mode = raw, "Unsupported output mode, using voltage");
                }
                sensor.set_value(OutputMode::Voltage.as_f64(), None, None);
                OutputMode::Voltage
            }
        }
    }

    fn fix_voltage_target(
        &self,
        bank: &SensorBank,
        targets: &mut TargetRegistry,
        id: &ChannelId,
    ) -> Option<f64> {
        let sensor = bank.target_mut(targets, id, TargetKind::Voltage)?;
        let volts = sensor.value();
        if volts.is_nan() {
            return None;
        }
        let clamped = volts.clamp(self.limits.min_voltage, self.limits.max_voltage);
        if clamped != volts {
            warn!(
                channel = %id,
                requested = volts,
                applied = clamped,
                "Voltage target out of range"
            );
            sensor.set_value(clamped, None, None);
        }
        Some(clamped)
    }

    fn fix_power_target(
        &self,
        bank: &SensorBank,
        targets: &mut TargetRegistry,
        id: &ChannelId,
    ) -> Option<f64> {
        let sensor = bank.target_mut(targets, id, TargetKind::Power)?;
        let watts = sensor.value();
        if watts.is_nan() {
            return None;
        }
        if !self.limits.can_set_power {
            warn!(channel = %id, "Power targets are not supported here");
            sensor.clear();
            return None;
        }
        if watts < 0.0 {
            warn!(channel = %id, requested = watts, "Negative power target, using 0");
            sensor.set_value(0.0, None, None);
            return Some(0.0);
        }
        Some(watts)
    }

    fn fix_temperature_target(
        &self,
        bank: &SensorBank,
        targets: &mut TargetRegistry,
        id: &ChannelId,
    ) -> Option<f64> {
        let sensor = bank.target_mut(targets, id, TargetKind::Temperature)?;
        let kelvin = sensor.value();
        if kelvin.is_nan() {
            return None;
        }
        if !self.limits.can_set_temperature {
            warn!(channel = %id, "Temperature targets are not supported here");
            sensor.clear();
            return None;
        }
        let (low, high) = TEMPERATURE_RANGE;
        if !(low..=high).contains(&kelvin) {
            warn!(channel = %id, requested = kelvin, "Temperature target out of range, ignoring");
            sensor.clear();
            return None;
        }
        Some(kelvin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRegistry;
    use crate::instrument::channels::{BankContext, ChannelConfig, ChannelDefaults, IdScheme};

    #[derive(Default)]
    struct Driver {
        volts: Vec<(ChannelId, f64)>,
        temps: Vec<(ChannelId, Option<f64>)>,
    }

    impl OutputDriver for Driver {
        fn set_voltage(&mut self, channel: &ChannelId, volts: f64) {
            self.volts.push((channel.clone(), volts));
        }

        fn set_temperature(&mut self, channel: &ChannelId, kelvin: Option<f64>) {
            self.temps.push((channel.clone(), kelvin));
        }
    }

    fn setup(layout: &str) -> (SensorBank, TargetRegistry) {
        let calibrations = CalibrationRegistry::new();
        let ctx = BankContext {
            calibrations: &calibrations,
            log_root: None,
        };
        let mut config = ChannelConfig::named("H1");
        config.r_total = Some(200.0);
        config.r_heater = Some(100.0);
        let mut bank = SensorBank::build(
            "sim",
            &[config],
            None,
            IdScheme::Positional,
            &ChannelDefaults::new(layout),
            &ctx,
        )
        .expect("bank");
        let mut registry = TargetRegistry::new();
        bank.connect_targets(&mut registry).expect("connect");
        (bank, registry)
    }

    fn control(power: bool, temperature: bool) -> OutputControl {
        OutputControl::new(OutputLimits {
            can_set_power: power,
            can_set_temperature: temperature,
            ..OutputLimits::default()
        })
    }

    #[test]
    fn test_conversions_invert() {
        let (bank, _) = setup("heater:setp");
        let channel = &bank.channels()[0];
        let volts = power_to_voltage(channel, 0.25);
        assert!((volts - 10.0).abs() < 1e-12);
        assert!((voltage_to_power(channel, volts) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_voltage_target_clamped_and_applied() {
        let (bank, mut registry) = setup("heater");
        registry.set_target(TargetKind::Voltage, "H1", 12.5);
        let mut driver = Driver::default();
        assert!(control(false, false).process(&bank, &mut registry, &mut driver));
        assert_eq!(driver.volts, vec![(ChannelId::Index(0), 10.0)]);
        assert_eq!(registry.find_mut(TargetKind::Voltage, "H1").map(|s| s.value()), Some(10.0));
        assert_eq!(
            registry.find_mut(TargetKind::OutputMode, "H1").map(|s| s.value()),
            Some(0.0)
        );
    }

    #[test]
    fn test_no_change_within_tolerance() {
        let (mut bank, mut registry) = setup("heater");
        registry.set_target(TargetKind::Voltage, "H1", 2.0);
        bank.set(&ChannelId::Index(0), SensorType::VOLTAGE, 2.0005, None);
        let mut driver = Driver::default();
        assert!(!control(false, false).process(&bank, &mut registry, &mut driver));
        assert!(driver.volts.is_empty());
    }

    #[test]
    fn test_power_mode() {
        let (bank, mut registry) = setup("heater:setp");
        registry.set_target(TargetKind::Power, "H1", 0.25);
        registry.set_target(TargetKind::OutputMode, "H1", OutputMode::Power.as_f64());
        let mut driver = Driver::default();
        control(true, false).process(&bank, &mut registry, &mut driver);
        assert_eq!(driver.volts.len(), 1);
        assert!((driver.volts[0].1 - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_unsupported_mode_falls_back() {
        let (bank, mut registry) = setup("heater:setp");
        registry.set_target(TargetKind::OutputMode, "H1", OutputMode::Power.as_f64());
        registry.set_target(TargetKind::Voltage, "H1", 1.0);
        let mut driver = Driver::default();
        control(false, false).process(&bank, &mut registry, &mut driver);
        assert_eq!(driver.volts, vec![(ChannelId::Index(0), 1.0)]);
        assert_eq!(
            registry.find_mut(TargetKind::OutputMode, "H1").map(|s| s.value()),
            Some(0.0)
        );
    }

    #[test]
    fn test_temperature_mode_clears_voltage_target() {
        let (bank, mut registry) = setup("heater:setpt:imon");
        registry.set_target(TargetKind::Voltage, "H1", 3.0);
        registry.set_target(TargetKind::Temperature, "H1", 4.2);
        registry.set_target(TargetKind::OutputMode, "H1", OutputMode::Temperature.as_f64());
        let mut driver = Driver::default();
        control(true, true).process(&bank, &mut registry, &mut driver);
        assert!(driver.volts.is_empty());
        assert_eq!(driver.temps, vec![(ChannelId::Index(0), Some(4.2))]);
        assert!(registry
            .find_mut(TargetKind::Voltage, "H1")
            .is_some_and(|s| s.value().is_nan()));
    }

    #[test]
    fn test_out_of_range_temperature_ignored() {
        let (bank, mut registry) = setup("heater:setpt:imon");
        registry.set_target(TargetKind::Temperature, "H1", 400.0);
        registry.set_target(TargetKind::OutputMode, "H1", OutputMode::Temperature.as_f64());
        let mut driver = Driver::default();
        control(true, true).process(&bank, &mut registry, &mut driver);
        assert!(driver.temps.is_empty());
    }
}
