use crate::canonical::CanonicalBlock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum OneBlockError {
    #[error("invalid one-block suffix {0:?}, expected [a-z0-9]+")]
    InvalidSuffix(String),
    #[error("one-block io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to encode one-block file: {0}")]
    Encode(#[from] serde_json::Error),
}

/// On-disk form of a single forwarded block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneBlockFile {
    pub id: String,
    pub number: u64,
    pub previous_id: String,
    pub timestamp_ms: u64,
    pub lib_num: u64,
    pub payload_version: i32,
    /// Hex encoded payload
    pub payload: String,
}

impl From<&CanonicalBlock> for OneBlockFile {
    fn from(block: &CanonicalBlock) -> Self {
        let timestamp_ms = block
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id: block.id.clone(),
            number: block.number,
            previous_id: block.previous_id.clone(),
            timestamp_ms,
            lib_num: block.lib_num,
            payload_version: block.payload_version,
            payload: faster_hex::hex_string(&block.payload),
        }
    }
}

/// Local directory of one-block files, one file per forwarded block.
pub struct OneBlockStore {
    dir: PathBuf,
    suffix: String,
}

impl OneBlockStore {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Result<Self, OneBlockError> {
        let suffix = suffix.into();
        if suffix.is_empty()
            || !suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(OneBlockError::InvalidSuffix(suffix));
        }
        Ok(Self {
            dir: dir.into(),
            suffix,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, block: &CanonicalBlock) -> String {
        format!(
            "{:010}-{}-{}-{}-{}.json",
            block.number, block.id, block.previous_id, block.lib_num, self.suffix
        )
    }

    pub fn write(&self, block: &CanonicalBlock) -> Result<PathBuf, OneBlockError> {
        let path = self.dir.join(self.file_name(block));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| OneBlockError::Io { path, source }
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let json = serde_json::to_vec(&OneBlockFile::from(block))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&json).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        trace!(path = %path.display(), "Wrote one-block file");
        Ok(path)
    }
}
