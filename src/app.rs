//! Daemon assembly and the control loop.
//!
//! The [`Plant`] holds every instrument and the shared target registry behind one
//! `tokio::sync::Mutex`. The control loop takes the lock once per instrument update
//! and the command server takes it once per command, so a command is never applied
//! in the middle of a poll.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::calibration::CalibrationRegistry;
use crate::config::{ControlLoopSettings, HardwareConfig, Settings};
use crate::data::{Logger, SyncFrameLog};
use crate::error::{AppResult, DaqError};
use crate::instrument::{self, BuildContext, Instrument};
use crate::network::CommandServer;
use crate::sensor::TargetRegistry;

/// Instruments plus the targets the command server writes.
pub struct Plant {
    /// Instruments in polling order.
    pub instruments: Vec<Box<dyn Instrument>>,
    /// Every target sensor, by name and alias.
    pub targets: TargetRegistry,
}

impl Plant {
    /// Check channel names, attach the shared loggers, then move targets into the
    /// registry.
    pub fn new(
        mut instruments: Vec<Box<dyn Instrument>>,
        loggers: &[Arc<dyn Logger>],
    ) -> AppResult<Self> {
        let mut seen = HashSet::new();
        for instrument in &instruments {
            for name in instrument.channel_names() {
                if !seen.insert(name.clone()) {
                    return Err(DaqError::Configuration(format!(
                        "Channel name '{}' is used more than once",
                        name
                    )));
                }
            }
        }

        for instrument in instruments.iter_mut() {
            for logger in loggers {
                instrument.add_logger(logger.clone());
            }
        }

        let mut targets = TargetRegistry::new();
        for instrument in instruments.iter_mut() {
            instrument.connect_targets(&mut targets)?;
        }
        info!(
            instruments = instruments.len(),
            targets = targets.len(),
            "Plant assembled"
        );
        Ok(Self {
            instruments,
            targets,
        })
    }
}

/// Round-robin driver of [`Instrument::update`].
pub struct ControlLoop {
    plant: Arc<Mutex<Plant>>,
    timing: ControlLoopSettings,
    loggers: Vec<Arc<dyn Logger>>,
}

impl ControlLoop {
    /// Loop over `plant`; `loggers` are flushed after the instruments close.
    pub fn new(
        plant: Arc<Mutex<Plant>>,
        timing: ControlLoopSettings,
        loggers: Vec<Arc<dyn Logger>>,
    ) -> Self {
        Self {
            plant,
            timing,
            loggers,
        }
    }

    /// Update every instrument in turn until `stop` flips to true, then close them.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> AppResult<()> {
        let count = self.plant.lock().await.instruments.len();
        info!(instruments = count, "Control loop started");

        while !*stop.borrow() {
            for index in 0..count {
                self.update_one(index).await;
            }
            tokio::select! {
                _ = sleep(self.timing.idle_sleep) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Control loop stopping");
        self.shutdown().await
    }

    async fn update_one(&self, index: usize) {
        let mut guard = self.plant.lock().await;
        let Plant {
            instruments,
            targets,
        } = &mut *guard;
        let Some(instrument) = instruments.get_mut(index) else {
            return;
        };
        let started = Instant::now();
        instrument.update(targets);
        let elapsed = started.elapsed();
        if elapsed > self.timing.slow_update_warning {
            warn!(
                instrument = %instrument.kind(),
                elapsed = ?elapsed,
                limit = ?self.timing.slow_update_warning,
                "Slow instrument update"
            );
        }
    }

    /// Close every instrument once, under the plant lock, then flush the loggers.
    async fn shutdown(self) -> AppResult<()> {
        let mut errors = Vec::new();
        {
            let mut plant = self.plant.lock().await;
            for instrument in plant.instruments.iter_mut() {
                let kind = instrument.kind();
                match instrument.close().await {
                    Ok(()) => info!(instrument = %kind, "Instrument closed"),
                    Err(e) => {
                        error!(instrument = %kind, error = %e, "Instrument failed to close");
                        errors.push(e);
                    }
                }
            }
        }

        for logger in &self.loggers {
            if let Err(e) = logger.flush() {
                error!(error = %e, "Logger flush failed");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            info!("Control loop stopped");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

/// A fully assembled daemon, not yet running.
pub struct Daemon {
    plant: Arc<Mutex<Plant>>,
    control: ControlLoop,
    server: CommandServer,
}

impl Daemon {
    /// Build instruments and loggers, assemble the plant and bind the command
    /// listener.
    pub async fn start(settings: Settings, hardware: HardwareConfig) -> AppResult<Self> {
        Self::start_with_calibrations(settings, hardware, CalibrationRegistry::new()).await
    }

    /// [`Self::start`] with extra calibration curves available to channels.
    pub async fn start_with_calibrations(
        settings: Settings,
        hardware: HardwareConfig,
        calibrations: CalibrationRegistry,
    ) -> AppResult<Self> {
        settings.validate()?;
        let data_dir = settings.storage.data_dir.clone();
        let ctx = BuildContext::new(
            Some(data_dir.clone()),
            settings.serial.clone(),
            settings.scpi.clone(),
            calibrations,
        );

        let mut loggers: Vec<Arc<dyn Logger>> = Vec::new();
        if let Some(sync_frames) = &settings.sync_frames {
            let log = SyncFrameLog::new(&data_dir, sync_frames)?;
            info!(folder = %log.folder().display(), "Sync frame logging enabled");
            loggers.push(Arc::new(log));
        }

        let mut instruments = Vec::with_capacity(hardware.devices.len());
        for device in hardware.devices {
            let instrument = instrument::build(device, &ctx)?;
            info!(
                instrument = %instrument.kind(),
                channels = ?instrument.channel_names(),
                "Instrument configured"
            );
            instruments.push(instrument);
        }

        let plant = Arc::new(Mutex::new(Plant::new(instruments, &loggers)?));
        let server = CommandServer::bind(settings.command_server.addr(), plant.clone()).await?;
        let control = ControlLoop::new(plant.clone(), settings.control_loop.clone(), loggers);
        Ok(Self {
            plant,
            control,
            server,
        })
    }

    /// Address the command listener is bound to.
    pub fn command_addr(&self) -> AppResult<SocketAddr> {
        self.server.local_addr()
    }

    /// Shared plant, for inspection.
    pub fn plant(&self) -> Arc<Mutex<Plant>> {
        self.plant.clone()
    }

    /// Run the control loop and command listener until `signal` resolves, then stop
    /// both and close the instruments.
    pub async fn run_until<F>(self, signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(self.server.run(stop_rx.clone()));
        let control = tokio::spawn(self.control.run(stop_rx));

        signal.await;
        info!("Shutdown requested");
        if stop_tx.send(true).is_err() {
            warn!("Shutdown signal had no listeners");
        }

        if let Err(e) = server.await {
            warn!(error = %e, "Command server task ended abnormally");
        }
        match control.await {
            Ok(result) => result,
            Err(e) => Err(DaqError::Instrument(format!("Control loop task failed: {}", e))),
        }
    }
}
