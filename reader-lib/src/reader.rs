use crate::canonical::{canonicalize, CanonicalBlock, EncodingError};
use crate::one_block::{OneBlockError, OneBlockStore};
use crate::readiness::HeadObserver;
use crate::supervisor::NodeOutput;
use crate::sync_state::{SyncState, SyncStateError, SyncStateStore};
use protocol::{parse_record, DecodeError, NativeRecord, SuiBlock};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("undecodable node record: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("duplicate block #{0}")]
    Duplicate(u64),
    #[error("out of order block #{number} after #{last}")]
    OutOfOrder { number: u64, last: u64 },
    #[error("gap in block feed: expected #{expected}, got #{number}")]
    Gap { expected: u64, number: u64 },
    #[error("block #{number} links to {previous_id:?}, expected {expected:?}")]
    Unlinked {
        number: u64,
        previous_id: String,
        expected: String,
    },
    #[error("replayed block #{number} has id {id:?}, already forwarded as {expected:?}")]
    ReplayMismatch {
        number: u64,
        id: String,
        expected: String,
    },
    #[error("failed to checkpoint: {0}")]
    Checkpoint(#[from] SyncStateError),
    #[error(transparent)]
    OneBlock(#[from] OneBlockError),
    #[error("publish channel closed")]
    PublishClosed,
}

/// Why the reader stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The configured stop block was forwarded
    StopBlockReached(u64),
    Shutdown,
    /// The supervisor side of the record channel went away
    SourceClosed,
}

/// Turns node records into canonical blocks on the publish channel.
#[derive(bon::Builder)]
pub struct BlockReader {
    records_rx: flume::Receiver<NodeOutput>,
    publish_tx: flume::Sender<Arc<CanonicalBlock>>,
    sync_state: Arc<SyncStateStore>,
    #[builder(default)]
    head_observers: Vec<Arc<dyn HeadObserver>>,
    one_block_store: Option<OneBlockStore>,
    /// Blocks below this are never forwarded
    #[builder(default)]
    start_block: u64,
    /// Inclusive
    stop_block: Option<u64>,
    #[builder(default = 1)]
    checkpoint_interval: u64,
    /// Last block forwarded by a previous run, as recorded in the sync state
    last_forwarded: Option<u64>,
    shutdown_rx: oneshot::Receiver<()>,
    #[builder(skip)]
    last_id: Option<String>,
    #[builder(skip)]
    replaying: bool,
}

impl BlockReader {
    pub async fn run(mut self) -> Result<ReaderExit, ReaderError> {
        info!(
            start_block = self.start_block,
            stop_block = ?self.stop_block,
            last_forwarded = ?self.last_forwarded,
            "Block reader started"
        );
        let exit = loop {
            let output = tokio::select! {
                biased;
                _ = &mut self.shutdown_rx => break ReaderExit::Shutdown,
                output = self.records_rx.recv_async() => output,
            };
            let exit = match output {
                Err(_) => Some(ReaderExit::SourceClosed),
                Ok(NodeOutput::Launched { start_block }) => {
                    self.handle_launch(start_block);
                    None
                }
                Ok(NodeOutput::Record(line)) => self.handle_record(&line).await?,
            };
            if let Some(exit) = exit {
                break exit;
            }
        };
        info!(?exit, last_forwarded = ?self.last_forwarded, "Block reader stopped");
        Ok(exit)
    }

    fn handle_launch(&mut self, start_block: u64) {
        self.replaying = self.last_forwarded.is_some();
        debug!(
            start_block,
            last_forwarded = ?self.last_forwarded,
            replaying = self.replaying,
            "Node launched"
        );
    }

    async fn handle_record(&mut self, line: &str) -> Result<Option<ReaderExit>, ReaderError> {
        match parse_record(line)? {
            NativeRecord::Init {
                protocol_version,
                node_version,
            } => {
                info!(%protocol_version, %node_version, "Node block output initialized");
                Ok(None)
            }
            NativeRecord::Block(block) => self.handle_block(&block).await,
        }
    }

    async fn handle_block(&mut self, block: &SuiBlock) -> Result<Option<ReaderExit>, ReaderError> {
        let number = block.number();
        if number < self.start_block {
            trace!(number, start_block = self.start_block, "Skipping block before start");
            return Ok(None);
        }
        if let Some(stop_block) = self.stop_block {
            if number > stop_block {
                return Ok(Some(ReaderExit::StopBlockReached(stop_block)));
            }
        }
        if !self.check_sequence(block)? {
            return Ok(None);
        }

        let canonical = Arc::new(canonicalize(block)?);
        if let Some(store) = &self.one_block_store {
            store.write(&canonical)?;
        }
        tokio::select! {
            biased;
            _ = &mut self.shutdown_rx => {
                debug!(number, "Abandoning in-flight block on shutdown");
                return Ok(Some(ReaderExit::Shutdown));
            }
            sent = self.publish_tx.send_async(canonical.clone()) => {
                sent.map_err(|_| ReaderError::PublishClosed)?
            }
        }

        self.last_forwarded = Some(number);
        self.last_id = Some(canonical.id.clone());
        for observer in &self.head_observers {
            observer.set_last_block_seen(number, canonical.timestamp);
        }
        trace!(block = %canonical, "Forwarded block");

        if number % self.checkpoint_interval.max(1) == 0 {
            self.sync_state.save(SyncState { block_num: number })?;
            debug!(block_num = number, "Checkpointed");
        }

        match self.stop_block {
            Some(stop_block) if number >= stop_block => {
                info!(stop_block, "Stop block reached");
                Ok(Some(ReaderExit::StopBlockReached(number)))
            }
            _ => Ok(None),
        }
    }

    /// Validates ordering against the last forwarded block. Returns false
    /// for blocks replayed by a relaunched node which must be skipped.
    fn check_sequence(&mut self, block: &SuiBlock) -> Result<bool, ReaderError> {
        let number = block.number();
        let Some(last) = self.last_forwarded else {
            if number != self.start_block {
                warn!(number, start_block = self.start_block, "First block is past the start block");
            }
            return Ok(true);
        };

        if number <= last {
            if !self.replaying {
                return Err(if number == last {
                    ReaderError::Duplicate(number)
                } else {
                    ReaderError::OutOfOrder { number, last }
                });
            }
            if number == last {
                match &self.last_id {
                    Some(expected) if expected != block.id() => {
                        return Err(ReaderError::ReplayMismatch {
                            number,
                            id: block.id().to_string(),
                            expected: expected.clone(),
                        });
                    }
                    Some(_) => {}
                    None => self.last_id = Some(block.id().to_string()),
                }
            }
            trace!(number, last, "Skipping replayed block");
            return Ok(false);
        }

        self.replaying = false;
        if number != last + 1 {
            return Err(ReaderError::Gap {
                expected: last + 1,
                number,
            });
        }
        if let Some(expected) = &self.last_id {
            if expected != block.previous_id() {
                return Err(ReaderError::Unlinked {
                    number,
                    previous_id: block.previous_id().to_string(),
                    expected: expected.clone(),
                });
            }
        }
        Ok(true)
    }
}
