use crate::canonical::CanonicalBlock;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// What to do with a subscriber whose channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait until the subscriber catches up
    #[default]
    Block,
    /// Drop the subscriber once it stays full longer than `timeout`
    DisconnectSlow { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeadInfo {
    pub number: u64,
    pub id: String,
    pub timestamp_ms: u64,
    pub lib_num: u64,
}

impl From<&CanonicalBlock> for HeadInfo {
    fn from(block: &CanonicalBlock) -> Self {
        Self {
            number: block.number,
            id: block.id.clone(),
            timestamp_ms: block
                .timestamp
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            lib_num: block.lib_num,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("block #{from} is no longer retained, oldest available is #{oldest}")]
    OutOfRange { from: u64, oldest: u64 },
    #[error("subscriber {id} stayed full for {timeout:?}, disconnected")]
    BackpressureTimeout { id: u64, timeout: Duration },
}

pub struct Subscription {
    pub id: u64,
    pub blocks: flume::Receiver<Arc<CanonicalBlock>>,
}

struct Subscriber {
    id: u64,
    from: u64,
    tx: flume::Sender<Arc<CanonicalBlock>>,
}

#[derive(Default)]
struct State {
    retained: VecDeque<Arc<CanonicalBlock>>,
    subscribers: Vec<Subscriber>,
    /// Set once `run` has returned, nothing is published afterwards
    stopped: bool,
}

/// Fans the published block stream out to in-process subscribers.
///
/// The most recent `retention` blocks are kept so a subscriber can start
/// from any of them; everything after is delivered live.
#[derive(Clone)]
pub struct BlockStreamServer {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
    retention: usize,
    subscriber_capacity: usize,
    policy: BackpressurePolicy,
}

impl BlockStreamServer {
    pub fn new(retention: usize, subscriber_capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            state: Default::default(),
            next_id: Default::default(),
            retention: retention.max(1),
            subscriber_capacity: subscriber_capacity.max(1),
            policy,
        }
    }

    pub fn head_info(&self) -> Option<HeadInfo> {
        self.state
            .lock()
            .retained
            .back()
            .map(|block| HeadInfo::from(block.as_ref()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Subscribes to every block numbered `from` or higher.
    pub fn subscribe(&self, from: u64) -> Result<Subscription, StreamError> {
        let mut state = self.state.lock();
        if let Some(oldest) = state.retained.front() {
            if from < oldest.number {
                return Err(StreamError::OutOfRange {
                    from,
                    oldest: oldest.number,
                });
            }
        }

        let backlog: Vec<_> = state
            .retained
            .iter()
            .filter(|block| block.number >= from)
            .cloned()
            .collect();
        let (tx, rx) = flume::bounded(self.subscriber_capacity + backlog.len());
        let backlog_len = backlog.len();
        for block in backlog {
            // capacity covers the whole backlog
            _ = tx.try_send(block);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if state.stopped {
            // dropping the sender ends the subscription after the backlog
            debug!(id, from, backlog = backlog_len, "Server stopped, subscriber gets the backlog only");
            return Ok(Subscription { id, blocks: rx });
        }
        state.subscribers.push(Subscriber { id, from, tx });
        debug!(id, from, backlog = backlog_len, "Subscriber registered");
        Ok(Subscription { id, blocks: rx })
    }

    /// Forwards every published block until the publisher side closes.
    pub async fn run(&self, publish_rx: flume::Receiver<Arc<CanonicalBlock>>) -> u64 {
        info!("Block stream server started");
        self.state.lock().stopped = false;
        let mut served = 0;
        while let Ok(block) = publish_rx.recv_async().await {
            let targets: Vec<_> = {
                let mut state = self.state.lock();
                state.retained.push_back(block.clone());
                while state.retained.len() > self.retention {
                    state.retained.pop_front();
                }
                state
                    .subscribers
                    .iter()
                    .filter(|sub| block.number >= sub.from)
                    .map(|sub| (sub.id, sub.tx.clone()))
                    .collect()
            };

            let mut dropped = Vec::new();
            for (id, tx) in targets {
                if let Err(err) = self.deliver(id, &tx, block.clone()).await {
                    warn!(%err, block_num = block.number, "Dropping subscriber");
                    dropped.push(id);
                } else if tx.is_disconnected() {
                    dropped.push(id);
                }
            }
            if !dropped.is_empty() {
                self.state
                    .lock()
                    .subscribers
                    .retain(|sub| !dropped.contains(&sub.id));
            }
            served += 1;
        }

        // closing the senders ends every subscription
        {
            let mut state = self.state.lock();
            state.subscribers.clear();
            state.stopped = true;
        }
        info!(served, "Block stream server stopped");
        served
    }

    async fn deliver(
        &self,
        id: u64,
        tx: &flume::Sender<Arc<CanonicalBlock>>,
        block: Arc<CanonicalBlock>,
    ) -> Result<(), StreamError> {
        match self.policy {
            BackpressurePolicy::Block => {
                // a vanished subscriber is removed through is_disconnected
                _ = tx.send_async(block).await;
                Ok(())
            }
            BackpressurePolicy::DisconnectSlow { timeout } => {
                match tokio::time::timeout(timeout, tx.send_async(block)).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(StreamError::BackpressureTimeout { id, timeout }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, tests::sui_block};

    fn block(n: u64) -> Arc<CanonicalBlock> {
        Arc::new(canonicalize(&sui_block(n)).unwrap())
    }

    fn numbers(rx: &flume::Receiver<Arc<CanonicalBlock>>) -> Vec<u64> {
        rx.drain().map(|b| b.number).collect()
    }

    #[tokio::test]
    async fn test_live_subscription_in_order() {
        let server = BlockStreamServer::new(16, 64, BackpressurePolicy::Block);
        let sub = server.subscribe(0).unwrap();
        let (publish_tx, publish_rx) = flume::bounded(4);
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.run(publish_rx).await }
        });
        for n in 10..20 {
            publish_tx.send_async(block(n)).await.unwrap();
        }
        drop(publish_tx);

        assert_eq!(task.await.unwrap(), 10);
        assert_eq!(numbers(&sub.blocks), (10..20).collect::<Vec<_>>());
        assert!(sub.blocks.is_disconnected());
        assert_eq!(server.head_info().unwrap().number, 19);
    }

    #[tokio::test]
    async fn test_subscribe_from_retained_block() {
        let server = BlockStreamServer::new(5, 64, BackpressurePolicy::Block);
        let (publish_tx, publish_rx) = flume::unbounded();
        for n in 0..10 {
            publish_tx.send(block(n)).unwrap();
        }
        drop(publish_tx);
        server.run(publish_rx).await;

        assert_eq!(
            server.subscribe(2).err(),
            Some(StreamError::OutOfRange { from: 2, oldest: 5 })
        );
        let sub = server.subscribe(7).unwrap();
        assert_eq!(numbers(&sub.blocks), vec![7, 8, 9]);
        let sub = server.subscribe(42).unwrap();
        assert!(sub.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_after_stop_ends_after_backlog() {
        let server = BlockStreamServer::new(16, 64, BackpressurePolicy::Block);
        let live = server.subscribe(0).unwrap();
        assert_eq!(server.subscriber_count(), 1);
        let (publish_tx, publish_rx) = flume::unbounded();
        for n in 0..3 {
            publish_tx.send(block(n)).unwrap();
        }
        drop(publish_tx);
        server.run(publish_rx).await;
        assert_eq!(server.subscriber_count(), 0);
        assert!(live.blocks.is_disconnected());

        let late = server.subscribe(1).unwrap();
        assert_eq!(server.subscriber_count(), 0);
        let mut seen = Vec::new();
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while let Ok(block) = late.blocks.recv_async().await {
                seen.push(block.number);
            }
        })
        .await;
        assert!(drained.is_ok(), "late subscription never ended");
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_backlog_then_live_without_duplicates() {
        let server = BlockStreamServer::new(100, 64, BackpressurePolicy::Block);
        let (publish_tx, publish_rx) = flume::unbounded();
        for n in 0..5 {
            publish_tx.send(block(n)).unwrap();
        }
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.run(publish_rx).await }
        });
        while server.head_info().map(|h| h.number) != Some(4) {
            tokio::task::yield_now().await;
        }

        let sub = server.subscribe(3).unwrap();
        for n in 5..8 {
            publish_tx.send(block(n)).unwrap();
        }
        drop(publish_tx);
        task.await.unwrap();
        assert_eq!(numbers(&sub.blocks), vec![3, 4, 5, 6, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_is_disconnected() {
        let server = BlockStreamServer::new(
            16,
            1,
            BackpressurePolicy::DisconnectSlow {
                timeout: Duration::from_secs(2),
            },
        );
        let slow = server.subscribe(0).unwrap();
        let fast = server.subscribe(0).unwrap();
        let (publish_tx, publish_rx) = flume::unbounded();
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.run(publish_rx).await }
        });

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(block) = fast.blocks.recv_async().await {
                seen.push(block.number);
            }
            seen
        });
        for n in 0..4 {
            publish_tx.send(block(n)).unwrap();
        }
        drop(publish_tx);

        assert_eq!(task.await.unwrap(), 4);
        assert_eq!(reader.await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(numbers(&slow.blocks), vec![0]);
        assert!(slow.blocks.is_disconnected());
    }
}
