use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A certified Sui checkpoint as printed by the instrumented node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiBlock {
    pub sequence_number: u64,
    /// Base58 checkpoint digest
    pub digest: String,
    /// Digest of the parent checkpoint, absent for genesis
    pub previous_digest: Option<String>,
    pub epoch: u64,
    pub timestamp_ms: u64,
    pub network_total_transactions: u64,
    pub transactions: Vec<CheckpointTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointTransaction {
    pub digest: String,
    pub sender: String,
    pub gas_used: u64,
    pub raw_effects: Vec<u8>,
}

impl SuiBlock {
    pub fn id(&self) -> &str {
        &self.digest
    }

    pub fn number(&self) -> u64 {
        self.sequence_number
    }

    pub fn previous_id(&self) -> &str {
        self.previous_digest.as_deref().unwrap_or_default()
    }

    pub fn time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.timestamp_ms)
    }

    /// Checkpoints are final once certified, so everything below the current
    /// one is irreversible.
    pub fn lib_num(&self) -> u64 {
        self.sequence_number.saturating_sub(1)
    }
}
