//! Local command interface.
//!
//! External tools change targets by writing short text lines to a loopback TCP
//! port. [`server`] accepts them; [`command`] parses, applies and sends them.

pub mod command;
pub mod server;

pub use command::{send_command, CommandError, CommandKind, TargetCommand};
pub use server::CommandServer;
