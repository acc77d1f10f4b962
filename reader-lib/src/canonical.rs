use protocol::SuiBlock;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

pub const PAYLOAD_VERSION: i32 = 1;

/// Chain-independent block envelope handed to downstream consumers.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalBlock {
    pub id: String,
    pub number: u64,
    pub previous_id: String,
    pub timestamp: SystemTime,
    pub lib_num: u64,
    pub payload_version: i32,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl fmt::Debug for CanonicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalBlock")
            .field("id", &self.id)
            .field("number", &self.number)
            .field("previous_id", &self.previous_id)
            .field("lib_num", &self.lib_num)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl fmt::Display for CanonicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.id)
    }
}

#[derive(Debug, Error)]
#[error("unable to marshal block #{number} to binary form: {source}")]
pub struct EncodingError {
    pub number: u64,
    #[source]
    pub source: bincode::Error,
}

pub fn canonicalize(block: &SuiBlock) -> Result<CanonicalBlock, EncodingError> {
    let payload = bincode::serialize(block).map_err(|source| EncodingError {
        number: block.number(),
        source,
    })?;
    Ok(CanonicalBlock {
        id: block.id().to_string(),
        number: block.number(),
        previous_id: block.previous_id().to_string(),
        timestamp: block.time(),
        lib_num: block.lib_num(),
        payload_version: PAYLOAD_VERSION,
        payload,
    })
}
