//! Channel configuration and per-instrument sensor storage.
//!
//! A channel is one physical input. It may fan out into several sensors (a heater
//! reports voltage and current and accepts a voltage target), all keyed by
//! [`SensorKey`]: the channel id plus the semantic type.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::error;

use crate::calibration::{Calibration, CalibrationRegistry};
use crate::data::Logger;
use crate::error::{AppResult, DaqError};
use crate::sensor::{
    expand_type, Quantity, Sensor, SensorOptions, SensorType, TargetHandle, TargetKind,
    TargetRegistry,
};

/// Identifier of a channel within its instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum ChannelId {
    /// Position or numeric hardware index.
    Index(usize),
    /// Hardware label such as `A` or `I1`.
    Key(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Index(i) => write!(f, "{}", i),
            ChannelId::Key(k) => f.write_str(k),
        }
    }
}

impl From<&str> for ChannelId {
    fn from(key: &str) -> Self {
        ChannelId::Key(key.to_string())
    }
}

impl From<usize> for ChannelId {
    fn from(index: usize) -> Self {
        ChannelId::Index(index)
    }
}

/// Composite map key for one sensor of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorKey {
    /// Owning channel.
    pub channel: ChannelId,
    /// Semantic type.
    pub sensor_type: SensorType,
}

impl SensorKey {
    /// Build a key.
    pub fn new(channel: impl Into<ChannelId>, sensor_type: SensorType) -> Self {
        Self {
            channel: channel.into(),
            sensor_type,
        }
    }
}

/// One type name or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    /// A single type or composite layout name.
    One(String),
    /// Explicit list of types or layout names.
    Many(Vec<String>),
}

impl TypeSpec {
    /// Expand into concrete sensor types.
    pub fn expand(&self) -> AppResult<Vec<SensorType>> {
        let names: Vec<&str> = match self {
            TypeSpec::One(s) => vec![s.as_str()],
            TypeSpec::Many(v) => v.iter().map(String::as_str).collect(),
        };
        let mut types = Vec::new();
        for name in names {
            for t in expand_type(name)? {
                if !types.contains(&t) {
                    types.push(t);
                }
            }
        }
        Ok(types)
    }
}

/// Channel entry from the hardware description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Globally unique sensor name.
    pub name: String,
    /// Sensor type(s); defaults to the instrument's.
    #[serde(default, rename = "type")]
    pub types: Option<TypeSpec>,
    /// Secondary name.
    #[serde(default)]
    pub alias: Option<String>,
    /// Explicit channel id.
    #[serde(default)]
    pub id: Option<ChannelId>,
    /// Calibration name.
    #[serde(default)]
    pub calib_func: Option<String>,
    /// Log the derivative too.
    #[serde(default)]
    pub save_deriv: Option<bool>,
    /// Log raw samples next to downsampled ones.
    #[serde(default)]
    pub save_fast: Option<bool>,
    /// Raw samples per logged line.
    #[serde(default)]
    pub downsample: Option<usize>,
    /// Exponential filter coefficient.
    #[serde(default)]
    pub filter: Option<f64>,
    /// Total heater circuit resistance, ohms.
    #[serde(default)]
    pub r_total: Option<f64>,
    /// Heater element resistance, ohms.
    #[serde(default)]
    pub r_heater: Option<f64>,
    /// Output current limit, amps.
    #[serde(default)]
    pub current_limit: Option<f64>,
    /// Output range selector.
    #[serde(default)]
    pub output_range: Option<f64>,
}

impl ChannelConfig {
    /// Minimal channel with just a name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            types: None,
            alias: None,
            id: None,
            calib_func: None,
            save_deriv: None,
            save_fast: None,
            downsample: None,
            filter: None,
            r_total: None,
            r_heater: None,
            current_limit: None,
            output_range: None,
        }
    }
}

/// Instrument-wide defaults applied to channels that do not override them.
#[derive(Debug, Clone)]
pub struct ChannelDefaults {
    /// Default sensor type(s).
    pub types: TypeSpec,
    /// Default calibration name.
    pub calibration: String,
    /// Default downsample factor.
    pub downsample: usize,
    /// Default derivative flag.
    pub save_deriv: bool,
    /// Default fast-log flag.
    pub save_fast: bool,
}

impl ChannelDefaults {
    /// Defaults with the given type and no processing.
    pub fn new(types: &str) -> Self {
        Self {
            types: TypeSpec::One(types.to_string()),
            calibration: crate::calibration::IDENTITY.to_string(),
            downsample: 1,
            save_deriv: false,
            save_fast: false,
        }
    }
}

/// How channels without explicit ids are numbered.
#[derive(Debug, Clone, Copy)]
pub enum IdScheme<'a> {
    /// Position in the list.
    Positional,
    /// Hardware label at the same position.
    Labels(&'a [&'a str]),
}

/// Shared inputs for building a bank.
pub struct BankContext<'a> {
    /// Registry to resolve `calib_func` against.
    pub calibrations: &'a CalibrationRegistry,
    /// Root of the date-sharded logs; `None` disables them.
    pub log_root: Option<&'a Path>,
}

/// A resolved channel.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel id.
    pub id: ChannelId,
    /// Sensor name.
    pub name: String,
    /// Sensor types produced.
    pub types: Vec<SensorType>,
    /// Raw-to-physical conversion.
    pub calibration: Calibration,
    /// The configuration it was built from.
    pub config: ChannelConfig,
}

/// All sensors of one instrument.
pub struct SensorBank {
    channels: Vec<Channel>,
    by_id: HashMap<ChannelId, usize>,
    sensors: HashMap<SensorKey, Sensor>,
    targets: HashMap<SensorKey, TargetHandle>,
}

impl SensorBank {
    /// Validate channel configuration and create the sensors.
    ///
    /// `expected` is the fixed channel count of the hardware, if it has one.
    pub fn build(
        instrument: &str,
        configs: &[ChannelConfig],
        expected: Option<usize>,
        ids: IdScheme<'_>,
        defaults: &ChannelDefaults,
        ctx: &BankContext<'_>,
    ) -> AppResult<Self> {
        let invalid = |msg: String| DaqError::Configuration(format!("{}: {}", instrument, msg));

        if let Some(n) = expected {
            if configs.len() != n {
                return Err(invalid(format!(
                    "expected {} channels, got {}",
                    n,
                    configs.len()
                )));
            }
        }
        let explicit = configs.iter().filter(|c| c.id.is_some()).count();
        if explicit != 0 && explicit != configs.len() {
            return Err(invalid(
                "channel ids must be given for all channels or for none".into(),
            ));
        }

        let mut bank = Self {
            channels: Vec::with_capacity(configs.len()),
            by_id: HashMap::new(),
            sensors: HashMap::new(),
            targets: HashMap::new(),
        };

        for (position, config) in configs.iter().enumerate() {
            let id = match (&config.id, ids) {
                (Some(id), _) => id.clone(),
                (None, IdScheme::Positional) => ChannelId::Index(position),
                (None, IdScheme::Labels(labels)) => match labels.get(position) {
                    Some(label) => ChannelId::from(*label),
                    None => {
                        return Err(invalid(format!(
                            "no channel label for position {}",
                            position
                        )))
                    }
                },
            };
            if bank.by_id.contains_key(&id) {
                return Err(invalid(format!("Duplicate channel id: '{}'", id)));
            }

            let filter = config.filter.unwrap_or(1.0);
            if !(0.0..=1.0).contains(&filter) {
                return Err(invalid(format!(
                    "filter {} on '{}' is outside [0, 1]",
                    filter, config.name
                )));
            }

            let types = config.types.as_ref().unwrap_or(&defaults.types).expand()?;
            let calibration = match config.calib_func.as_deref() {
                None | Some("") | Some("default") => {
                    ctx.calibrations.resolve(&defaults.calibration)?
                }
                Some(name) => ctx.calibrations.resolve(name)?,
            };

            let options = SensorOptions {
                alias: config.alias.clone(),
                downsample: config.downsample.unwrap_or(defaults.downsample),
                save_derivative: config.save_deriv.unwrap_or(defaults.save_deriv),
                save_fast: config.save_fast.unwrap_or(defaults.save_fast),
                filter,
            };
            for sensor_type in &types {
                let sensor = Sensor::new(&config.name, *sensor_type, &options, ctx.log_root)?;
                bank.sensors
                    .insert(SensorKey::new(id.clone(), *sensor_type), sensor);
            }

            bank.by_id.insert(id.clone(), bank.channels.len());
            bank.channels.push(Channel {
                id,
                name: config.name.clone(),
                types,
                calibration,
                config: config.clone(),
            });
        }
        Ok(bank)
    }

    /// Channels in configuration order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Channel by id.
    pub fn channel(&self, id: &ChannelId) -> Option<&Channel> {
        self.by_id.get(id).map(|&i| &self.channels[i])
    }

    /// Channel names in configuration order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    /// Measured or derivative sensor.
    pub fn sensor(&self, id: &ChannelId, sensor_type: SensorType) -> Option<&Sensor> {
        self.sensors.get(&SensorKey::new(id.clone(), sensor_type))
    }

    /// Mutable measured or derivative sensor.
    pub fn sensor_mut(&mut self, id: &ChannelId, sensor_type: SensorType) -> Option<&mut Sensor> {
        self.sensors.get_mut(&SensorKey::new(id.clone(), sensor_type))
    }

    /// Latest value of a sensor; NaN when missing or unknown.
    pub fn value(&self, id: &ChannelId, sensor_type: SensorType) -> f64 {
        self.sensor(id, sensor_type).map_or(f64::NAN, Sensor::value)
    }

    /// Record a reading. Unknown sensors are logged and skipped; channels configured
    /// as `unused` swallow readings silently.
    pub fn set(
        &mut self,
        id: &ChannelId,
        sensor_type: SensorType,
        value: f64,
        timestamp: Option<f64>,
    ) {
        if let Some(sensor) = self.sensor_mut(id, sensor_type) {
            sensor.set_value(value, timestamp, None);
            return;
        }
        if self.sensor(id, SensorType::Measured(Quantity::Unused)).is_none() {
            error!(channel = %id, sensor_type = %sensor_type, "No such sensor");
        }
    }

    /// Attach a logger to every sensor still owned by the bank.
    pub fn add_logger(&mut self, logger: Arc<dyn Logger>) {
        for sensor in self.sensors.values_mut() {
            sensor.add_logger(logger.clone());
        }
    }

    /// Move target sensors into the shared registry.
    pub fn connect_targets(&mut self, registry: &mut TargetRegistry) -> AppResult<()> {
        let keys: Vec<SensorKey> = self
            .sensors
            .keys()
            .filter(|k| k.sensor_type.is_target())
            .cloned()
            .collect();
        for key in keys {
            if let Some(sensor) = self.sensors.remove(&key) {
                let handle = registry.register(sensor)?;
                self.targets.insert(key, handle);
            }
        }
        Ok(())
    }

    /// Handle of a channel's target.
    pub fn target_handle(&self, id: &ChannelId, kind: TargetKind) -> Option<TargetHandle> {
        self.targets
            .get(&SensorKey::new(id.clone(), SensorType::Target(kind)))
            .copied()
    }

    /// A channel's target sensor.
    pub fn target<'r>(
        &self,
        registry: &'r TargetRegistry,
        id: &ChannelId,
        kind: TargetKind,
    ) -> Option<&'r Sensor> {
        registry.get(self.target_handle(id, kind)?)
    }

    /// A channel's target sensor, mutably.
    pub fn target_mut<'r>(
        &self,
        registry: &'r mut TargetRegistry,
        id: &ChannelId,
        kind: TargetKind,
    ) -> Option<&'r mut Sensor> {
        registry.get_mut(self.target_handle(id, kind)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(configs: &[ChannelConfig], expected: Option<usize>) -> AppResult<SensorBank> {
        let calibrations = CalibrationRegistry::new();
        let ctx = BankContext {
            calibrations: &calibrations,
            log_root: None,
        };
        SensorBank::build(
            "test",
            configs,
            expected,
            IdScheme::Positional,
            &ChannelDefaults::new("heater"),
            &ctx,
        )
    }

    fn parse(json: &str) -> Vec<ChannelConfig> {
        serde_json::from_str(json).expect("channel json")
    }

    #[test]
    fn test_multi_type_fan_out() {
        let bank = build(&parse(r#"[{"name": "H_still"}]"#), Some(1)).expect("bank");
        let id = ChannelId::Index(0);
        assert!(bank.sensor(&id, SensorType::VOLTAGE).is_some());
        assert!(bank
            .sensor(&id, SensorType::Target(TargetKind::OutputMode))
            .is_some());
        assert_eq!(bank.channel(&id).map(|c| c.types.len()), Some(3));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let parsed: Result<Vec<ChannelConfig>, _> =
            serde_json::from_str(r#"[{"name": "T", "colour": "red"}]"#);
        assert!(parsed.is_err());
        let parsed: Result<Vec<ChannelConfig>, _> =
            serde_json::from_str(r#"[{"type": "temperature"}]"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_channel_count_checked() {
        assert!(build(&parse(r#"[{"name": "a"}]"#), Some(2)).is_err());
    }

    #[test]
    fn test_ids_all_or_none() {
        let configs = parse(r#"[{"name": "a", "id": 3}, {"name": "b"}]"#);
        assert!(build(&configs, None).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let configs = parse(r#"[{"name": "a", "id": "A"}, {"name": "b", "id": "A"}]"#);
        let err = build(&configs, None).err().expect("duplicate");
        assert!(err.to_string().contains("Duplicate channel id"));
    }

    #[test]
    fn test_filter_range_checked() {
        assert!(build(&parse(r#"[{"name": "a", "filter": 1.5}]"#), None).is_err());
    }

    #[test]
    fn test_unknown_calibration_rejected() {
        assert!(build(&parse(r#"[{"name": "a", "calib_func": "RX-102A"}]"#), None).is_err());
    }

    #[test]
    fn test_bad_type_rejected() {
        assert!(build(&parse(r#"[{"name": "a", "type": "flux"}]"#), None).is_err());
    }

    #[test]
    fn test_labels_and_type_list() {
        let calibrations = CalibrationRegistry::new();
        let ctx = BankContext {
            calibrations: &calibrations,
            log_root: None,
        };
        let configs = parse(r#"[{"name": "mc", "type": ["temperature", "resistance"]}]"#);
        let bank = SensorBank::build(
            "ls",
            &configs,
            None,
            IdScheme::Labels(&["A", "B"]),
            &ChannelDefaults::new("temperature"),
            &ctx,
        )
        .expect("bank");
        let a = ChannelId::from("A");
        assert!(bank.sensor(&a, SensorType::TEMPERATURE).is_some());
        assert!(bank
            .sensor(&a, SensorType::Measured(Quantity::Resistance))
            .is_some());
    }

    #[test]
    fn test_connect_targets_moves_sensors() {
        let mut bank = build(&parse(r#"[{"name": "H1", "alias": "still"}]"#), None).expect("bank");
        let mut registry = TargetRegistry::new();
        bank.connect_targets(&mut registry).expect("connect");
        let id = ChannelId::Index(0);

        assert_eq!(registry.len(), 2);
        assert!(bank
            .sensor(&id, SensorType::Target(TargetKind::Voltage))
            .is_none());
        assert!(registry.set_target(TargetKind::Voltage, "still", 1.25));
        assert_eq!(
            bank.target(&registry, &id, TargetKind::Voltage)
                .map(Sensor::value),
            Some(1.25)
        );
    }

    #[test]
    fn test_set_and_value() {
        let mut bank = build(&parse(r#"[{"name": "H1"}]"#), None).expect("bank");
        let id = ChannelId::Index(0);
        bank.set(&id, SensorType::VOLTAGE, 3.3, Some(1.0));
        assert_eq!(bank.value(&id, SensorType::VOLTAGE), 3.3);
        assert!(bank.value(&id, SensorType::TEMPERATURE).is_nan());
        bank.set(&id, SensorType::TEMPERATURE, 1.0, None);
    }
}
