//! Sliding window of frame-aligned readings.
//!
//! Readings carrying a sync number are placed into a matrix row chosen by that
//! number, so values from independent sensors line up on a common timeline. The
//! logger keeps `buffer_count` windows of `frame_count` rows in memory. When a
//! frame arrives past the newest window the oldest windows are written out as
//! `syncframes.<base>.npy` and the base moves forward.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{npy, LogRecord, LogValue, Logger};
use crate::error::{AppResult, DaqError};
use crate::sensor::SensorType;

/// Frames further back than this many windows trigger a full flush and rebase.
pub const PAST_REBASE_WINDOWS: i64 = 10;

const FILE_PREFIX: &str = "syncframes.";
const FILE_SUFFIX: &str = ".npy";

/// One reported sensor column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChannel {
    /// Sensor name.
    pub name: String,
    /// Sensor type name (e.g. `temperature`).
    #[serde(rename = "type")]
    pub sensor_type: String,
}

/// Settings for a [`SyncFrameLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncFrameConfig {
    /// Directory the blocks are written to, relative to the data directory.
    #[serde(default = "default_folder")]
    pub folder: PathBuf,
    /// Reported columns; index in this list is the column index.
    #[serde(default)]
    pub channels: Vec<SyncChannel>,
    /// Number of columns in each block.
    #[serde(default = "default_num_reported")]
    pub num_reported: usize,
    /// Rows per window.
    #[serde(default = "default_frame_count")]
    pub frame_count: usize,
    /// Windows held in memory.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Blocks kept on disk.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_folder() -> PathBuf {
    PathBuf::from("syncframes")
}

fn default_num_reported() -> usize {
    256
}

fn default_frame_count() -> usize {
    100
}

fn default_buffer_count() -> usize {
    5
}

fn default_max_files() -> usize {
    100
}

impl Default for SyncFrameConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            channels: Vec::new(),
            num_reported: default_num_reported(),
            frame_count: default_frame_count(),
            buffer_count: default_buffer_count(),
            max_files: default_max_files(),
        }
    }
}

impl SyncFrameConfig {
    /// Check sizes and column assignments.
    pub fn validate(&self) -> AppResult<()> {
        if self.frame_count == 0 || self.buffer_count == 0 || self.num_reported == 0 {
            return Err(DaqError::Configuration(
                "sync frame log needs non-zero frame_count, buffer_count and num_reported"
                    .to_string(),
            ));
        }
        if self.max_files == 0 {
            return Err(DaqError::Configuration(
                "sync frame log max_files must be at least 1".to_string(),
            ));
        }
        if self.channels.len() > self.num_reported {
            return Err(DaqError::Configuration(format!(
                "{} sync frame channels do not fit in {} reported columns",
                self.channels.len(),
                self.num_reported
            )));
        }
        Ok(())
    }
}

/// Frame-aligned block logger.
pub struct SyncFrameLog {
    folder: PathBuf,
    columns: HashMap<(String, SensorType), usize>,
    num_reported: usize,
    frame_count: i64,
    buffer_count: i64,
    max_files: usize,
    state: Mutex<WindowState>,
}

struct WindowState {
    base_sync: Option<i64>,
    windows: VecDeque<Vec<f64>>,
}

impl SyncFrameLog {
    /// Create the logger, removing blocks left over from a previous run.
    pub fn new(base: &Path, config: &SyncFrameConfig) -> AppResult<Self> {
        config.validate()?;

        let mut columns = HashMap::new();
        for (index, channel) in config.channels.iter().enumerate() {
            let sensor_type: SensorType = channel.sensor_type.parse()?;
            if columns
                .insert((channel.name.clone(), sensor_type), index)
                .is_some()
            {
                return Err(DaqError::Configuration(format!(
                    "Duplicate sync frame channel: '{}' ({})",
                    channel.name, sensor_type
                )));
            }
        }

        let folder = base.join(&config.folder);
        fs::create_dir_all(&folder)?;
        for old in block_files(&folder)? {
            debug!(path = %old.display(), "Removing stale sync frame block");
            fs::remove_file(&old)?;
        }

        let window_len = config.frame_count * config.num_reported;
        Ok(Self {
            folder,
            columns,
            num_reported: config.num_reported,
            frame_count: config.frame_count as i64,
            buffer_count: config.buffer_count as i64,
            max_files: config.max_files,
            state: Mutex::new(WindowState {
                base_sync: None,
                windows: (0..config.buffer_count)
                    .map(|_| vec![f64::NAN; window_len])
                    .collect(),
            }),
        })
    }

    /// Directory blocks are written to.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// First frame number of the oldest in-memory window, once known.
    pub fn base_sync(&self) -> Option<i64> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .base_sync
    }

    /// Path of the block whose first frame is `base`.
    pub fn block_path(&self, base: i64) -> PathBuf {
        self.folder
            .join(format!("{}{}{}", FILE_PREFIX, base, FILE_SUFFIX))
    }

    /// Base that leaves room for `buffer_count - 1` windows of history before `sync`.
    fn compute_base(&self, sync: i64) -> i64 {
        ((sync.div_euclid(self.frame_count) - (self.buffer_count - 1)) * self.frame_count).max(0)
    }

    /// Write out the oldest window and open a fresh one at the far end.
    fn save_oldest(&self, state: &mut WindowState) {
        let Some(base) = state.base_sync else {
            return;
        };
        let window_len = self.frame_count as usize * self.num_reported;
        let oldest = state
            .windows
            .pop_front()
            .unwrap_or_else(|| vec![f64::NAN; window_len]);
        state.windows.push_back(vec![f64::NAN; window_len]);
        state.base_sync = Some(base + self.frame_count);

        let path = self.block_path(base);
        match npy::write_f64(&path, self.frame_count as usize, self.num_reported, &oldest) {
            Ok(()) => debug!(path = %path.display(), "Saved sync frame block"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to save sync frame block"),
        }
        if let Err(e) = self.prune() {
            warn!(folder = %self.folder.display(), error = %e, "Failed to prune sync frame blocks");
        }
    }

    /// Remove the oldest blocks beyond the retention count.
    fn prune(&self) -> std::io::Result<()> {
        let files = block_files(&self.folder)?;
        if files.len() <= self.max_files {
            return Ok(());
        }
        let mut dated: Vec<_> = files
            .into_iter()
            .map(|p| {
                let stamp = fs::metadata(&p)
                    .and_then(|m| m.created().or_else(|_| m.modified()))
                    .ok();
                (stamp, block_base(&p), p)
            })
            .collect();
        dated.sort();
        let excess = dated.len() - self.max_files;
        for (_, _, path) in dated.into_iter().take(excess) {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn flush_windows(&self, state: &mut WindowState, count: i64) {
        for _ in 0..count {
            self.save_oldest(state);
        }
    }
}

impl Logger for SyncFrameLog {
    fn log(&self, record: &LogRecord<'_>) -> AppResult<()> {
        let Some(&column) = self
            .columns
            .get(&(record.name.to_string(), record.sensor_type))
        else {
            return Ok(());
        };
        let Some(sync) = record.sync else {
            warn!(sensor = record.name, "Sync frame log got a reading without a sync number");
            return Ok(());
        };
        let value = match record.value {
            LogValue::Number(v) => v,
            LogValue::Text(t) => match t.trim().parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    warn!(
                        sensor = record.name,
                        value = t,
                        "Sync frame log got a non-numeric value"
                    );
                    return Ok(());
                }
            },
        };

        let sync = sync as i64;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let base = *state
            .base_sync
            .get_or_insert_with(|| self.compute_base(sync));

        let window = (sync - base).div_euclid(self.frame_count);
        if window < -PAST_REBASE_WINDOWS {
            info!(sync, base, "Sync number far in the past, rebasing");
            self.flush_windows(&mut state, self.buffer_count);
            state.base_sync = Some(self.compute_base(sync));
        } else if window < 0 {
            warn!(sync, base, "Dropping late sync frame");
            return Ok(());
        } else if window >= self.buffer_count {
            let needed = window - self.buffer_count + 1;
            self.flush_windows(&mut state, needed.min(self.buffer_count));
            if needed > self.buffer_count {
                info!(sync, "Sync number jumped ahead, rebasing");
                state.base_sync = Some(self.compute_base(sync));
            }
        }

        let base = state.base_sync.unwrap_or(0);
        let window = (sync - base).div_euclid(self.frame_count) as usize;
        let row = (sync - base).rem_euclid(self.frame_count) as usize;
        if let Some(buf) = state.windows.get_mut(window) {
            buf[row * self.num_reported + column] = value;
        }
        Ok(())
    }

    fn flush(&self) -> AppResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_windows(&mut state, self.buffer_count);
        Ok(())
    }
}

/// Base frame number encoded in a block file name.
fn block_base(path: &Path) -> Option<i64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

fn block_files(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        let is_block = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
        if is_block {
            files.push(path);
        }
    }
    Ok(files)
}
