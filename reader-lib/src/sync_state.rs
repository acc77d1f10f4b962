use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SYNC_STATE_FILE_NAME: &str = "sync_state.json";

/// Durable checkpoint of the last block the reader fully forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub block_num: u64,
}

#[derive(Debug, Error)]
pub enum SyncStateError {
    #[error("no sync state at {0}")]
    NotFound(PathBuf),
    #[error("sync state at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("refusing to move sync state back from {current} to {requested}")]
    Regression { current: u64, requested: u64 },
    #[error("sync state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Single-writer store for the reader's [`SyncState`] file.
///
/// Writes go to a sibling temp file which is synced and renamed over the
/// target, so readers only ever observe a complete previous or next state.
pub struct SyncStateStore {
    path: PathBuf,
    // highest block num loaded or written through this store, held for the
    // whole duration of a write
    high_water: Mutex<Option<u64>>,
}

impl SyncStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            high_water: Mutex::new(None),
        }
    }

    pub fn in_dir(working_dir: &Path) -> Self {
        Self::new(working_dir.join(SYNC_STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<SyncState, SyncStateError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncStateError::NotFound(self.path.clone()));
            }
            Err(source) => {
                return Err(SyncStateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let state: SyncState =
            serde_json::from_slice(&bytes).map_err(|source| SyncStateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        let mut high_water = self.high_water.lock();
        *high_water = Some(high_water.map_or(state.block_num, |h| h.max(state.block_num)));
        debug!(block_num = state.block_num, path = %self.path.display(), "Loaded sync state");
        Ok(state)
    }

    pub fn save(&self, state: SyncState) -> Result<(), SyncStateError> {
        let mut high_water = self.high_water.lock();
        if let Some(current) = *high_water {
            if state.block_num < current {
                return Err(SyncStateError::Regression {
                    current,
                    requested: state.block_num,
                });
            }
        }
        self.write(state)?;
        *high_water = Some(state.block_num);
        debug!(block_num = state.block_num, "Saved sync state");
        Ok(())
    }

    /// Operator-forced overwrite, the only way to move the state backwards.
    pub fn reset(&self, state: SyncState) -> Result<(), SyncStateError> {
        let mut high_water = self.high_water.lock();
        if let Some(current) = *high_water {
            warn!(
                from = current,
                to = state.block_num,
                "Resetting sync state"
            );
        }
        self.write(state)?;
        *high_water = Some(state.block_num);
        info!(block_num = state.block_num, path = %self.path.display(), "Sync state reset");
        Ok(())
    }

    fn write(&self, state: SyncState) -> Result<(), SyncStateError> {
        let io_err = |source| SyncStateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec(&state).map_err(|source| SyncStateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&temp_path).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}
