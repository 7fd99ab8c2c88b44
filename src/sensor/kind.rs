//! Semantic sensor types.
//!
//! A sensor type is fixed when the sensor is created. Measured quantities come in
//! two flavours (the quantity itself and its time derivative); targets form their own
//! closed set so the command path can never write into a measured value.

use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, DaqError};

/// Physical quantity reported by a measured sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Placeholder for a channel that is wired but not read.
    Unused,
    /// Unitless floating-point reading.
    Float,
    /// Free text, logged without downsampling.
    String,
    /// Kelvin.
    Temperature,
    /// Volts.
    Voltage,
    /// Ohms.
    Resistance,
    /// Amps.
    Current,
    /// Amps per second.
    CurrentRamp,
    /// Watts.
    Power,
    /// Instrument-defined discrete state.
    State,
    /// Tesla.
    BField,
    /// Pressure gauge reading.
    Pressure,
    /// Relative humidity, percent.
    RelHumidity,
    /// Joules.
    Energy,
    /// Hertz.
    Frequency,
    /// Seconds.
    Time,
    /// Count.
    Number,
    /// Raw ADC units.
    Adu,
    /// Raw DAC setting.
    Dac,
    /// Percent.
    Percentage,
    /// Ratio in [0, 1].
    Fraction,
    /// Degrees.
    Angle,
    /// Stage position.
    Position,
}

impl Quantity {
    /// Every quantity, in declaration order.
    pub const ALL: [Quantity; 23] = [
        Quantity::Unused,
        Quantity::Float,
        Quantity::String,
        Quantity::Temperature,
        Quantity::Voltage,
        Quantity::Resistance,
        Quantity::Current,
        Quantity::CurrentRamp,
        Quantity::Power,
        Quantity::State,
        Quantity::BField,
        Quantity::Pressure,
        Quantity::RelHumidity,
        Quantity::Energy,
        Quantity::Frequency,
        Quantity::Time,
        Quantity::Number,
        Quantity::Adu,
        Quantity::Dac,
        Quantity::Percentage,
        Quantity::Fraction,
        Quantity::Angle,
        Quantity::Position,
    ];

    /// Name used in configuration files and log directories.
    pub fn as_str(self) -> &'static str {
        match self {
            Quantity::Unused => "unused",
            Quantity::Float => "float",
            Quantity::String => "string",
            Quantity::Temperature => "temperature",
            Quantity::Voltage => "voltage",
            Quantity::Resistance => "resistance",
            Quantity::Current => "current",
            Quantity::CurrentRamp => "currentramp",
            Quantity::Power => "power",
            Quantity::State => "state",
            Quantity::BField => "bfield",
            Quantity::Pressure => "pressure",
            Quantity::RelHumidity => "relhumidity",
            Quantity::Energy => "energy",
            Quantity::Frequency => "frequency",
            Quantity::Time => "time",
            Quantity::Number => "number",
            Quantity::Adu => "adu",
            Quantity::Dac => "dac",
            Quantity::Percentage => "percentage",
            Quantity::Fraction => "fraction",
            Quantity::Angle => "angle",
            Quantity::Position => "position",
        }
    }
}

/// Controllable output a target sensor represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// `vtarg`, volts.
    Voltage,
    /// `ptarg`, watts.
    Power,
    /// `ttarg`, kelvin.
    Temperature,
    /// `outputmode`, one of the output control modes.
    OutputMode,
    /// `itarg`, amps.
    Current,
    /// `irtarg`, amps per second.
    CurrentRamp,
    /// `starg`, an instrument-defined state such as a heater range.
    State,
    /// `percenttarg`, percent of full output.
    Percentage,
}

impl TargetKind {
    /// Every target kind, in declaration order.
    pub const ALL: [TargetKind; 8] = [
        TargetKind::Voltage,
        TargetKind::Power,
        TargetKind::Temperature,
        TargetKind::OutputMode,
        TargetKind::Current,
        TargetKind::CurrentRamp,
        TargetKind::State,
        TargetKind::Percentage,
    ];

    /// Name used in configuration files and log directories.
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Voltage => "vtarg",
            TargetKind::Power => "ptarg",
            TargetKind::Temperature => "ttarg",
            TargetKind::OutputMode => "outputmode",
            TargetKind::Current => "itarg",
            TargetKind::CurrentRamp => "irtarg",
            TargetKind::State => "starg",
            TargetKind::Percentage => "percenttarg",
        }
    }
}

/// Semantic type of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    /// A value read from hardware.
    Measured(Quantity),
    /// Time derivative of a measured value, per second.
    Derivative(Quantity),
    /// Desired future value of a controllable output.
    Target(TargetKind),
}

const DERIV_SUFFIX: &str = "deriv";

impl SensorType {
    /// Shorthand for a measured temperature.
    pub const TEMPERATURE: SensorType = SensorType::Measured(Quantity::Temperature);
    /// Shorthand for a measured voltage.
    pub const VOLTAGE: SensorType = SensorType::Measured(Quantity::Voltage);

    /// True for setpoint types written by the command path.
    pub fn is_target(self) -> bool {
        matches!(self, SensorType::Target(_))
    }

    /// Unused channels never reach a logger.
    pub fn is_logged(self) -> bool {
        self != SensorType::Measured(Quantity::Unused)
    }

    /// Type of the derivative child for a measured type.
    pub fn derivative(self) -> Option<SensorType> {
        match self {
            SensorType::Measured(q) => Some(SensorType::Derivative(q)),
            _ => None,
        }
    }

    /// Target kind, if this is a target type.
    pub fn target_kind(self) -> Option<TargetKind> {
        match self {
            SensorType::Target(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Measured(q) => f.write_str(q.as_str()),
            SensorType::Derivative(q) => write!(f, "{}{}", q.as_str(), DERIV_SUFFIX),
            SensorType::Target(t) => f.write_str(t.as_str()),
        }
    }
}

impl FromStr for SensorType {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(kind) = TargetKind::ALL.iter().find(|k| k.as_str() == s) {
            return Ok(SensorType::Target(*kind));
        }
        if let Some(q) = Quantity::ALL.iter().find(|q| q.as_str() == s) {
            return Ok(SensorType::Measured(*q));
        }
        if let Some(base) = s.strip_suffix(DERIV_SUFFIX) {
            if let Some(q) = Quantity::ALL.iter().find(|q| q.as_str() == base) {
                return Ok(SensorType::Derivative(*q));
            }
        }
        Err(DaqError::Configuration(format!("Bad sensor type '{}'", s)))
    }
}

/// Composite channel layouts and the sensor types each one fans out into.
const MULTI_TYPES: &[(&str, &[&str])] = &[
    ("heater", &["voltage", "vtarg", "outputmode"]),
    ("heater:imon", &["voltage", "vtarg", "current", "outputmode"]),
    (
        "heater:setp",
        &["voltage", "power", "outputmode", "vtarg", "ptarg"],
    ),
    (
        "heater:setp:imon",
        &["voltage", "current", "power", "outputmode", "vtarg", "ptarg"],
    ),
    (
        "heater:setpt:imon",
        &[
            "voltage",
            "current",
            "power",
            "temperature",
            "outputmode",
            "vtarg",
            "ptarg",
            "ttarg",
        ],
    ),
    ("imon", &["voltage", "current"]),
    ("thermometer:diode", &["voltage", "temperature"]),
    (
        "thermometer:diode:exc",
        &["voltage", "temperature", "current", "power"],
    ),
    ("thermometer:resistor", &["resistance", "temperature"]),
    (
        "thermometer:resistor:exc",
        &["resistance", "temperature", "voltage", "current", "dac"],
    ),
];

/// Expand one configured type string into the sensor types it produces.
///
/// Composite names such as `heater:setp` expand to several types; anything else
/// must be a single known type.
pub fn expand_type(spec: &str) -> AppResult<Vec<SensorType>> {
    match MULTI_TYPES.iter().find(|(name, _)| *name == spec) {
        Some((_, parts)) => parts.iter().map(|p| p.parse()).collect(),
        None => Ok(vec![spec.parse()?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for q in Quantity::ALL {
            let t = SensorType::Measured(q);
            assert_eq!(t.to_string().parse::<SensorType>().ok(), Some(t));
            let d = SensorType::Derivative(q);
            assert_eq!(d.to_string().parse::<SensorType>().ok(), Some(d));
        }
        for k in TargetKind::ALL {
            let t = SensorType::Target(k);
            assert_eq!(t.to_string().parse::<SensorType>().ok(), Some(t));
        }
    }

    #[test]
    fn test_derivative_name() {
        let t: SensorType = "temperaturederiv".parse().expect("valid type");
        assert_eq!(t, SensorType::Derivative(Quantity::Temperature));
        assert!(SensorType::Target(TargetKind::Voltage).derivative().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!("kelvinometer".parse::<SensorType>().is_err());
        assert!(expand_type("heater:bogus").is_err());
    }

    #[test]
    fn test_multi_type_expansion() {
        let types = expand_type("heater:setp").expect("known layout");
        assert_eq!(
            types,
            vec![
                SensorType::VOLTAGE,
                SensorType::Measured(Quantity::Power),
                SensorType::Target(TargetKind::OutputMode),
                SensorType::Target(TargetKind::Voltage),
                SensorType::Target(TargetKind::Power),
            ]
        );
        assert_eq!(
            expand_type("resistance").expect("single type"),
            vec![SensorType::Measured(Quantity::Resistance)]
        );
    }

    #[test]
    fn test_unused_not_logged() {
        assert!(!SensorType::Measured(Quantity::Unused).is_logged());
        assert!(SensorType::TEMPERATURE.is_logged());
    }
}
