//! Loopback command listener.
//!
//! Each client gets its own task. Lines are parsed as [`TargetCommand`]s and applied
//! while holding the plant lock, so a command never interleaves with an instrument
//! update.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::command::TargetCommand;
use crate::app::Plant;
use crate::error::{AppResult, DaqError};

/// Bind attempts before giving up.
pub const BIND_ATTEMPTS: u32 = 5;

/// Pause between bind attempts.
pub const BIND_RETRY: Duration = Duration::from_secs(1);

/// Longest accepted command line, in bytes.
pub const MAX_LINE: usize = 4096;

/// The command listener.
pub struct CommandServer {
    listener: TcpListener,
    plant: Arc<Mutex<Plant>>,
}

impl CommandServer {
    /// Bind to a loopback address, retrying while the port is still held.
    pub async fn bind(addr: SocketAddr, plant: Arc<Mutex<Plant>>) -> AppResult<Self> {
        if !addr.ip().is_loopback() {
            return Err(DaqError::Configuration(format!(
                "Command server must bind to a loopback address, not {}",
                addr.ip()
            )));
        }
        let mut attempt = 1;
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(addr = %listener.local_addr()?, "Command server listening");
                    return Ok(Self { listener, plant });
                }
                Err(e) if attempt < BIND_ATTEMPTS => {
                    warn!(%addr, attempt, error = %e, "Command server bind failed, retrying");
                    attempt += 1;
                    sleep(BIND_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `stop` flips to true, then drop every client.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut clients = JoinSet::new();
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Command client connected");
                        clients.spawn(handle_client(stream, peer, self.plant.clone()));
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                Some(finished) = clients.join_next(), if !clients.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "Command client task ended abnormally");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        clients.shutdown().await;
        info!("Command server stopped");
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, plant: Arc<Mutex<Plant>>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%peer, error = %e, "Command client read failed");
                break;
            }
        }

        if !buf.ends_with(b"\n") && buf.len() > MAX_LINE {
            warn!(%peer, limit = MAX_LINE, "Dropping over-long command line");
            if let Err(e) = discard_line(&mut reader).await {
                warn!(%peer, error = %e, "Command client read failed");
                break;
            }
            continue;
        }

        let Ok(text) = std::str::from_utf8(&buf) else {
            error!(%peer, packet = ?String::from_utf8_lossy(&buf), "Invalid packet: not UTF-8");
            continue;
        };
        let line = text.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }

        match TargetCommand::parse(line) {
            Ok(command) => {
                info!(%peer, command = %line, "Valid command");
                let mut plant = plant.lock().await;
                command.apply(&mut plant.targets);
            }
            Err(e) => error!(%peer, packet = %line, error = %e, "Invalid packet"),
        }
    }
    debug!(%peer, "Command client disconnected");
}

/// Skip the rest of the current line.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    let mut scratch = Vec::with_capacity(MAX_LINE);
    loop {
        scratch.clear();
        let n = (&mut *reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut scratch)
            .await?;
        if n == 0 || scratch.ends_with(b"\n") {
            return Ok(());
        }
    }
}
