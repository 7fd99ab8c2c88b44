//! Target-setting commands.
//!
//! One command per line: `<cmd>,<percent-escaped name>,<value>`. Commands set a target
//! by sensor name or alias; `vset`, `pset` and `tset` also switch the output mode.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::data::format::{percent_decode, percent_encode};
use crate::error::AppResult;
use crate::instrument::OutputMode;
use crate::sensor::{TargetKind, TargetRegistry};

/// Why a command line was rejected.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    /// The line did not split into command, name and value.
    #[error("Wrong number of values: expected 3, got {0}")]
    FieldCount(usize),

    /// The value field is not a number.
    #[error("Bad value '{0}'")]
    BadNumber(String),

    /// The value parsed but is NaN or infinite.
    #[error("Non-finite value {0}")]
    NonFinite(f64),

    /// The command field is not in the vocabulary.
    #[error("Bad command '{0}'")]
    UnknownCommand(String),
}

/// Command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `vset`: voltage target, selects voltage mode.
    SetVoltage,
    /// `pset`: power target, selects power mode.
    SetPower,
    /// `iset`
    SetCurrent,
    /// `irset`
    SetCurrentRamp,
    /// `sset`
    SetState,
    /// `tset`: temperature target, selects temperature mode.
    SetTemperature,
    /// `perset`
    SetPercentage,
}

impl CommandKind {
    /// Every command.
    pub const ALL: [CommandKind; 7] = [
        CommandKind::SetVoltage,
        CommandKind::SetPower,
        CommandKind::SetCurrent,
        CommandKind::SetCurrentRamp,
        CommandKind::SetState,
        CommandKind::SetTemperature,
        CommandKind::SetPercentage,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::SetVoltage => "vset",
            CommandKind::SetPower => "pset",
            CommandKind::SetCurrent => "iset",
            CommandKind::SetCurrentRamp => "irset",
            CommandKind::SetState => "sset",
            CommandKind::SetTemperature => "tset",
            CommandKind::SetPercentage => "perset",
        }
    }

    /// Target the command writes.
    pub fn target(self) -> TargetKind {
        match self {
            CommandKind::SetVoltage => TargetKind::Voltage,
            CommandKind::SetPower => TargetKind::Power,
            CommandKind::SetCurrent => TargetKind::Current,
            CommandKind::SetCurrentRamp => TargetKind::CurrentRamp,
            CommandKind::SetState => TargetKind::State,
            CommandKind::SetTemperature => TargetKind::Temperature,
            CommandKind::SetPercentage => TargetKind::Percentage,
        }
    }

    /// Output mode the command selects, if any.
    pub fn output_mode(self) -> Option<OutputMode> {
        match self {
            CommandKind::SetVoltage => Some(OutputMode::Voltage),
            CommandKind::SetPower => Some(OutputMode::Power),
            CommandKind::SetTemperature => Some(OutputMode::Temperature),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CommandError::UnknownCommand(s.to_string()))
    }
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetCommand {
    /// What to set.
    pub kind: CommandKind,
    /// Sensor name or alias, unescaped.
    pub name: String,
    /// New target value. Always finite.
    pub value: f64,
}

impl TargetCommand {
    /// Build a command, rejecting non-finite values.
    pub fn new(kind: CommandKind, name: &str, value: f64) -> Result<Self, CommandError> {
        if !value.is_finite() {
            return Err(CommandError::NonFinite(value));
        }
        Ok(Self {
            kind,
            name: name.to_string(),
            value,
        })
    }

    /// Parse one line. Trailing whitespace (including `\r`) is ignored.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() != 3 {
            return Err(CommandError::FieldCount(fields.len()));
        }
        let name = percent_decode(fields[1]);
        let value: f64 = fields[2]
            .trim()
            .parse()
            .map_err(|_| CommandError::BadNumber(fields[2].to_string()))?;
        if !value.is_finite() {
            return Err(CommandError::NonFinite(value));
        }
        let kind = fields[0].parse()?;
        Ok(Self { kind, name, value })
    }

    /// Write the target (and output mode) into the registry.
    ///
    /// Returns false if the name has no such target; the miss is logged.
    pub fn apply(&self, targets: &mut TargetRegistry) -> bool {
        let found = targets.set_target(self.kind.target(), &self.name, self.value);
        if let Some(mode) = self.kind.output_mode() {
            targets.set_target(TargetKind::OutputMode, &self.name, mode.as_f64());
        }
        found
    }

    /// Wire form, without line delimiters.
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.kind, percent_encode(&self.name), self.value)
    }
}

impl fmt::Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Send one command to a running daemon.
///
/// The line is written as `\n<line>\n` so any partial line the server holds from an
/// earlier client is terminated first.
pub async fn send_command(addr: SocketAddr, command: &TargetCommand) -> AppResult<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let packet = format!("\n{}\n", command.to_line());
    debug!(%addr, packet = %packet.trim(), "Sending command");
    stream.write_all(packet.as_bytes()).await?;
    stream.shutdown().await?;
    info!(%addr, command = %command, "Command sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{Sensor, SensorOptions, SensorType};
    use tracing_test::traced_test;

    fn registry() -> TargetRegistry {
        let mut registry = TargetRegistry::new();
        let options = SensorOptions {
            alias: Some("still".into()),
            ..SensorOptions::default()
        };
        for kind in [TargetKind::Voltage, TargetKind::OutputMode, TargetKind::State] {
            let sensor =
                Sensor::new("H_still", SensorType::Target(kind), &options, None).expect("sensor");
            registry.register(sensor).expect("register");
        }
        registry
    }

    fn value(registry: &mut TargetRegistry, kind: TargetKind) -> f64 {
        registry.find_mut(kind, "H_still").map_or(f64::NAN, |s| s.value())
    }

    #[test]
    fn test_parse() {
        let cmd = TargetCommand::parse("vset,Heater%201,12.5\r").expect("parse");
        assert_eq!(cmd.kind, CommandKind::SetVoltage);
        assert_eq!(cmd.name, "Heater 1");
        assert_eq!(cmd.value, 12.5);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            TargetCommand::parse("notanumber"),
            Err(CommandError::FieldCount(1))
        );
        assert!(matches!(
            TargetCommand::parse("vset,a,abc"),
            Err(CommandError::BadNumber(_))
        ));
        assert!(matches!(
            TargetCommand::parse("vset,a,inf"),
            Err(CommandError::NonFinite(_))
        ));
        assert!(matches!(
            TargetCommand::parse("vset,a,nan"),
            Err(CommandError::NonFinite(_))
        ));
        assert_eq!(
            TargetCommand::parse("zap,a,1"),
            Err(CommandError::UnknownCommand("zap".into()))
        );
    }

    #[test]
    fn test_line_round_trip() {
        let cmd = TargetCommand::new(CommandKind::SetTemperature, "T/mc stage", 0.0125)
            .expect("command");
        assert_eq!(cmd.to_line(), "tset,T%2Fmc%20stage,0.0125");
        assert_eq!(TargetCommand::parse(&cmd.to_line()), Ok(cmd));
        assert!(TargetCommand::new(CommandKind::SetPower, "x", f64::INFINITY).is_err());
    }

    #[test]
    fn test_apply_sets_mode() {
        let mut registry = registry();
        let cmd = TargetCommand::parse("vset,still,3.5").expect("parse");
        assert!(cmd.apply(&mut registry));
        assert_eq!(value(&mut registry, TargetKind::Voltage), 3.5);
        assert_eq!(value(&mut registry, TargetKind::OutputMode), 0.0);

        let cmd = TargetCommand::parse("sset,H_still,2").expect("parse");
        assert!(cmd.apply(&mut registry));
        assert_eq!(value(&mut registry, TargetKind::State), 2.0);
        assert_eq!(value(&mut registry, TargetKind::OutputMode), 0.0);
    }

    #[test]
    #[traced_test]
    fn test_apply_unknown_name() {
        let mut registry = registry();
        let cmd = TargetCommand::parse("pset,H_nowhere,1").expect("parse");
        assert!(!cmd.apply(&mut registry));
        assert!(logs_contain("name doesn't exist"));
    }
}
