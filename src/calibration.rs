//! Named conversions from raw readings to physical units.
//!
//! Curve fitting lives outside the daemon. The registry only maps names used in
//! channel configuration to functions; the embedding program registers its curves
//! before instruments are built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};

/// Raw-to-physical conversion.
pub type CalibrationFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Name of the pass-through calibration.
pub const IDENTITY: &str = "identity";

/// A resolved calibration.
#[derive(Clone)]
pub struct Calibration {
    name: String,
    func: CalibrationFn,
}

impl Calibration {
    /// Wrap a function under a name.
    pub fn new(name: impl Into<String>, func: CalibrationFn) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }

    /// Pass-through calibration.
    pub fn identity() -> Self {
        Self::new(IDENTITY, Arc::new(|raw: f64| raw))
    }

    /// Name the calibration was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Convert a raw reading.
    pub fn apply(&self, raw: f64) -> f64 {
        (self.func)(raw)
    }
}

impl fmt::Debug for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Calibration").field(&self.name).finish()
    }
}

/// Lookup table of calibrations by name.
#[derive(Clone)]
pub struct CalibrationRegistry {
    entries: HashMap<String, CalibrationFn>,
}

impl Default for CalibrationRegistry {
    fn default() -> Self {
        let mut registry = Self {
            entries: HashMap::new(),
        };
        registry.register(IDENTITY, Arc::new(|raw: f64| raw));
        registry
    }
}

impl CalibrationRegistry {
    /// Registry holding the built-in calibrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a calibration.
    pub fn register(&mut self, name: &str, func: CalibrationFn) {
        self.entries.insert(name.to_string(), func);
    }

    /// Resolve a configured name.
    pub fn resolve(&self, name: &str) -> AppResult<Calibration> {
        self.entries
            .get(name)
            .map(|func| Calibration::new(name, func.clone()))
            .ok_or_else(|| DaqError::Configuration(format!("Unknown calibration '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registered() {
        let mut registry = CalibrationRegistry::new();
        registry.register("mk_to_k", Arc::new(|raw: f64| raw / 1000.0));
        let cal = registry.resolve("mk_to_k").expect("registered");
        assert_eq!(cal.apply(250.0), 0.25);
        assert_eq!(registry.resolve(IDENTITY).expect("builtin").apply(3.0), 3.0);
    }

    #[test]
    fn test_unknown_is_configuration_error() {
        let registry = CalibrationRegistry::new();
        assert!(matches!(
            registry.resolve("RX102A"),
            Err(DaqError::Configuration(_))
        ));
    }
}
