//! Process-wide registry of target sensors.
//!
//! Instruments move their target sensors in here at startup and keep
//! [`TargetHandle`]s. The command server finds targets by kind and name (or alias)
//! without going through the instrument. Both sides reach the registry only while
//! holding the plant lock, so a command never lands in the middle of a poll.

use std::collections::HashMap;

use tracing::{debug, error};

use super::{Sensor, TargetKind};
use crate::error::{AppResult, DaqError};

/// Stable reference to a registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(usize);

/// Target sensors indexed by kind and name.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    slots: Vec<Sensor>,
    index: HashMap<TargetKind, HashMap<String, TargetHandle>>,
}

impl TargetRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a target sensor, indexing it by name and alias.
    pub fn register(&mut self, sensor: Sensor) -> AppResult<TargetHandle> {
        let Some(kind) = sensor.sensor_type().target_kind() else {
            return Err(DaqError::Configuration(format!(
                "'{}' is a {} sensor, not a target",
                sensor.name(),
                sensor.sensor_type()
            )));
        };

        let handle = TargetHandle(self.slots.len());
        let names = self.index.entry(kind).or_default();
        let keys: Vec<String> = std::iter::once(sensor.name().to_string())
            .chain(sensor.alias().map(str::to_string))
            .collect();
        for key in &keys {
            if names.contains_key(key) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate {} target: '{}'",
                    kind.as_str(),
                    key
                )));
            }
        }
        for key in keys {
            names.insert(key, handle);
        }
        debug!(target_kind = kind.as_str(), name = sensor.name(), "Registered target");
        self.slots.push(sensor);
        Ok(handle)
    }

    /// Handle for a target by kind and name or alias.
    pub fn lookup(&self, kind: TargetKind, name: &str) -> Option<TargetHandle> {
        self.index.get(&kind).and_then(|m| m.get(name)).copied()
    }

    /// Target behind a handle.
    pub fn get(&self, handle: TargetHandle) -> Option<&Sensor> {
        self.slots.get(handle.0)
    }

    /// Mutable target behind a handle.
    pub fn get_mut(&mut self, handle: TargetHandle) -> Option<&mut Sensor> {
        self.slots.get_mut(handle.0)
    }

    /// Mutable target by kind and name or alias.
    pub fn find_mut(&mut self, kind: TargetKind, name: &str) -> Option<&mut Sensor> {
        let handle = self.lookup(kind, name)?;
        self.get_mut(handle)
    }

    /// Current value of a target; NaN when unset.
    pub fn value(&self, handle: TargetHandle) -> f64 {
        self.get(handle).map_or(f64::NAN, Sensor::value)
    }

    /// Overwrite a target value. Returns false (and logs) if no such target exists.
    pub fn set_target(&mut self, kind: TargetKind, name: &str, value: f64) -> bool {
        match self.find_mut(kind, name) {
            Some(sensor) => {
                sensor.set_value(value, None, None);
                true
            }
            None => {
                error!(
                    target_kind = kind.as_str(),
                    name, "Can't set target, name doesn't exist"
                );
                false
            }
        }
    }

    /// Names (and aliases) registered under `kind`, sorted.
    pub fn names(&self, kind: TargetKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .index
            .get(&kind)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of registered target sensors.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
