//! Hardware description: which devices exist and how their channels are named.
//!
//! The file is either a strict JSON array of device entries or a TOML document
//! with a `devices` array of tables. The format is picked by extension.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppResult, DaqError};
use crate::instrument::DeviceConfig;

/// Parsed hardware description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    /// Devices in polling order.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    /// Read a hardware file. `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            DaqError::Configuration(format!(
                "Cannot read hardware file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            Self::from_toml_str(&text)
        } else {
            Self::from_json_str(&text)
        };
        parsed.map_err(|e| DaqError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Parse a JSON array of device entries.
    pub fn from_json_str(text: &str) -> AppResult<Self> {
        let devices: Vec<DeviceConfig> = serde_json::from_str(text)
            .map_err(|e| DaqError::Configuration(format!("Invalid hardware JSON: {}", e)))?;
        Ok(Self { devices })
    }

    /// Parse a TOML document with a `devices` array.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        toml::from_str(text)
            .map_err(|e| DaqError::Configuration(format!("Invalid hardware TOML: {}", e)))
    }

    /// Device type tags, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.devices
            .iter()
            .map(|d| match d {
                DeviceConfig::Ls336(_) => "ls336",
                DeviceConfig::SimHeater(_) => "sim_heater",
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().expect("temp file");
        write!(
            file,
            r#"[
  {{"type": "ls336", "port": "/dev/serial/by-id/usb-LSCI", "gpib_address": 12,
    "channels": [{{"name": "T_mc"}}, {{"name": "T_still"}}, {{"name": "T_4k"}},
                 {{"name": "T_50k"}}, {{"name": "H_sorb"}}, {{"name": "H_switch"}}]}},
  {{"type": "sim_heater", "channels": [{{"name": "H_sim"}}]}}
]"#
        )
        .expect("write");

        let hardware = HardwareConfig::load(file.path()).expect("hardware");
        assert_eq!(hardware.kinds(), vec!["ls336", "sim_heater"]);
        match &hardware.devices[0] {
            DeviceConfig::Ls336(config) => {
                assert_eq!(config.gpib_address, Some(12));
                assert_eq!(config.channels.len(), 6);
            }
            other => panic!("unexpected device {:?}", other),
        }
    }

    #[test]
    fn test_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().expect("temp file");
        write!(
            file,
            r#"
[[devices]]
type = "sim_heater"
wait_time = 0.5
channels = [{{ name = "H_a", r_total = 200.0, r_heater = 100.0 }}]
"#
        )
        .expect("write");

        let hardware = HardwareConfig::load(file.path()).expect("hardware");
        assert_eq!(hardware.kinds(), vec!["sim_heater"]);
    }

    #[test]
    fn test_rejects_relaxed_json() {
        let text = r#"[{"type": "sim_heater", "channels": [],},]"#;
        assert!(HardwareConfig::from_json_str(text).is_err());
        let text = "// heaters\n[]";
        assert!(HardwareConfig::from_json_str(text).is_err());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let text = r#"[{"type": "sim_heater", "channels": [], "colour": "red"}]"#;
        let err = HardwareConfig::from_json_str(text).err().expect("unknown key");
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_missing_file() {
        assert!(HardwareConfig::load(Path::new("/nonexistent/hardware.json")).is_err());
    }
}
