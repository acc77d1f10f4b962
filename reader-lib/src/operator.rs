use crate::block_stream::BlockStreamServer;
use crate::bootstrap::{BootstrapError, Bootstrapper};
use crate::canonical::CanonicalBlock;
use crate::one_block::OneBlockStore;
use crate::readiness::{HeadObserver, MetricsAndReadinessManager};
use crate::reader::{BlockReader, ReaderError, ReaderExit};
use crate::supervisor::{NodeOutput, ProcessExit, Supervisor, SupervisorError};
use crate::sync_state::{SyncState, SyncStateError, SyncStateStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatorPhase {
    Bootstrapping,
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("invalid node setup: {0}")]
    Config(#[from] BootstrapError),
    #[error("sync state is corrupt, refusing to start: {0}")]
    StateCorruption(#[source] SyncStateError),
    #[error("sync state: {0}")]
    SyncState(#[source] SyncStateError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("node process crashed {crashes} times in a row, giving up (last {last_exit})")]
    RestartsExhausted { crashes: u32, last_exit: ProcessExit },
    #[error("block reader failed: {0}")]
    Reader(#[from] ReaderError),
    #[error("block reader task failed: {0}")]
    ReaderTask(#[from] JoinError),
}

impl From<SyncStateError> for OperatorError {
    fn from(err: SyncStateError) -> Self {
        match err {
            SyncStateError::Corrupt { .. } => Self::StateCorruption(err),
            err => Self::SyncState(err),
        }
    }
}

/// Bounded exponential backoff between node restarts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt`, counting from one.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    StopBlockReached(u64),
    /// The record feed ended without a shutdown request
    SourceClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorSummary {
    pub reason: StopReason,
    /// Block number persisted as the final sync state
    pub final_block: Option<u64>,
    pub restarts: u32,
}

enum ControlEvent {
    Shutdown,
    ReaderDone(Result<Result<ReaderExit, ReaderError>, JoinError>),
    ProcessExited(Result<ProcessExit, flume::RecvError>),
}

struct Pipeline {
    reader_shutdown_tx: Option<oneshot::Sender<()>>,
    reader: JoinHandle<Result<ReaderExit, ReaderError>>,
    reader_done: bool,
    server: JoinHandle<u64>,
}

/// Runs the node from bootstrap to final checkpoint.
#[derive(bon::Builder)]
pub struct Operator {
    bootstrapper: Bootstrapper,
    supervisor: Supervisor,
    /// Receiving side of the supervisor's record channel
    records_rx: flume::Receiver<NodeOutput>,
    sync_state: Arc<SyncStateStore>,
    readiness: Arc<MetricsAndReadinessManager>,
    server: BlockStreamServer,
    #[builder(default)]
    restart_policy: RestartPolicy,
    /// Where to begin when no sync state exists yet
    #[builder(default)]
    first_streamable_block: u64,
    /// Blocks below this are dropped by the reader, defaults to the first
    /// streamable block
    start_block: Option<u64>,
    stop_block: Option<u64>,
    #[builder(default = 1)]
    checkpoint_interval: u64,
    #[builder(default = 1024)]
    publish_capacity: usize,
    one_block_store: Option<OneBlockStore>,
    /// Time given to the stream server to flush once draining starts
    #[builder(default)]
    shutdown_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    stop_grace: Duration,
    #[builder(skip = watch::channel(OperatorPhase::Bootstrapping).0)]
    phase_tx: watch::Sender<OperatorPhase>,
}

impl Operator {
    pub fn phase(&self) -> watch::Receiver<OperatorPhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: OperatorPhase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            info!(?previous, ?phase, last_block = ?self.supervisor.last_block_seen(), "Operator phase changed");
        }
    }

    pub async fn run(
        mut self,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<OperatorSummary, OperatorError> {
        match self.run_phases(shutdown_rx).await {
            Ok(summary) => {
                self.set_phase(OperatorPhase::Stopped);
                info!(reason = ?summary.reason, final_block = ?summary.final_block, "Operator stopped");
                Ok(summary)
            }
            Err(err) => {
                self.set_phase(OperatorPhase::Failed);
                error!(%err, last_block = ?self.supervisor.last_block_seen(), "Operator failed");
                Err(err)
            }
        }
    }

    async fn run_phases(
        &mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<OperatorSummary, OperatorError> {
        self.set_phase(OperatorPhase::Bootstrapping);
        self.bootstrapper.prepare()?;
        let resume = self.resume_point()?;

        self.set_phase(OperatorPhase::Starting);
        let mut pipeline = self.start_pipeline(resume);
        if let Some(block_num) = resume {
            self.supervisor.set_last_block_seen(block_num);
        }
        let start_block = resume.unwrap_or(self.first_streamable_block);
        if let Err(err) = self.supervisor.start(start_block).await {
            self.drain(&mut pipeline).await;
            return Err(err.into());
        }

        self.set_phase(OperatorPhase::Running);
        let mut restarts = 0;
        let outcome = self
            .control_loop(&mut pipeline, &mut shutdown_rx, &mut restarts)
            .await;

        self.set_phase(OperatorPhase::Draining);
        let final_block = self.drain(&mut pipeline).await;
        let saved = match final_block {
            Some(block_num) => self
                .sync_state
                .save(SyncState { block_num })
                .inspect(|_| info!(block_num, "Saved final sync state")),
            None => Ok(()),
        };
        let reason = outcome.inspect_err(|_| {
            if let Err(err) = &saved {
                error!(%err, "Failed to save final sync state");
            }
        })?;
        saved?;
        Ok(OperatorSummary {
            reason,
            final_block,
            restarts,
        })
    }

    fn resume_point(&self) -> Result<Option<u64>, OperatorError> {
        match self.sync_state.load() {
            Ok(state) => {
                info!(block_num = state.block_num, "Resuming from sync state");
                Ok(Some(state.block_num))
            }
            Err(SyncStateError::NotFound(path)) => {
                info!(
                    path = %path.display(),
                    first_streamable_block = self.first_streamable_block,
                    "No sync state, starting from the first streamable block"
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn start_pipeline(&mut self, resume: Option<u64>) -> Pipeline {
        let (publish_tx, publish_rx) = flume::bounded::<Arc<CanonicalBlock>>(self.publish_capacity);
        let (reader_shutdown_tx, reader_shutdown_rx) = oneshot::channel();
        let server = self.server.clone();
        let server = tokio::spawn(async move { server.run(publish_rx).await });

        let head_observers: Vec<Arc<dyn HeadObserver>> = vec![
            self.readiness.clone(),
            self.supervisor.process_state(),
        ];
        let reader = BlockReader::builder()
            .records_rx(self.records_rx.clone())
            .publish_tx(publish_tx)
            .sync_state(self.sync_state.clone())
            .head_observers(head_observers)
            .maybe_one_block_store(self.one_block_store.take())
            .start_block(self.start_block.unwrap_or(self.first_streamable_block))
            .maybe_stop_block(self.stop_block)
            .checkpoint_interval(self.checkpoint_interval)
            .maybe_last_forwarded(resume)
            .shutdown_rx(reader_shutdown_rx)
            .build();
        Pipeline {
            reader_shutdown_tx: Some(reader_shutdown_tx),
            reader: tokio::spawn(reader.run()),
            reader_done: false,
            server,
        }
    }

    async fn control_loop(
        &mut self,
        pipeline: &mut Pipeline,
        shutdown_rx: &mut oneshot::Receiver<()>,
        restarts: &mut u32,
    ) -> Result<StopReason, OperatorError> {
        let exits = self.supervisor.exits();
        let mut crashes = 0;
        let mut block_at_launch = self.supervisor.last_block_seen();
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut *shutdown_rx => ControlEvent::Shutdown,
                result = &mut pipeline.reader, if !pipeline.reader_done => ControlEvent::ReaderDone(result),
                exit = exits.recv_async() => ControlEvent::ProcessExited(exit),
            };

            match event {
                ControlEvent::Shutdown => {
                    info!("Shutdown requested");
                    return Ok(StopReason::Shutdown);
                }
                ControlEvent::ReaderDone(result) => {
                    pipeline.reader_done = true;
                    return match result?? {
                        ReaderExit::StopBlockReached(block_num) => {
                            Ok(StopReason::StopBlockReached(block_num))
                        }
                        ReaderExit::Shutdown => Ok(StopReason::Shutdown),
                        ReaderExit::SourceClosed => Ok(StopReason::SourceClosed),
                    };
                }
                ControlEvent::ProcessExited(exit) => {
                    let exit = exit.map_err(|_| {
                        SupervisorError::Monitor("exit channel closed".to_string())
                    })?;
                    // collect the dead process and the rest of its output
                    self.supervisor.stop(self.stop_grace).await?;
                    self.catch_up_reader(pipeline).await;
                    let last_block = self.supervisor.last_block_seen();
                    if last_block != block_at_launch {
                        crashes = 0;
                    }
                    crashes += 1;
                    if crashes > self.restart_policy.max_restarts {
                        return Err(OperatorError::RestartsExhausted {
                            crashes,
                            last_exit: exit,
                        });
                    }

                    let backoff = self.restart_policy.backoff_for(crashes);
                    warn!(%exit, attempt = crashes, backoff_ms = backoff.as_millis() as u64, last_block = ?last_block, "Node process crashed, restarting");
                    tokio::select! {
                        biased;
                        _ = &mut *shutdown_rx => {
                            info!("Shutdown requested during restart backoff");
                            return Ok(StopReason::Shutdown);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }

                    if self.bootstrapper.needs_prepare() {
                        warn!("Node data directory is gone, bootstrapping again");
                        self.set_phase(OperatorPhase::Bootstrapping);
                        self.bootstrapper.prepare()?;
                    }
                    self.set_phase(OperatorPhase::Starting);
                    let start_block = last_block.unwrap_or(self.first_streamable_block);
                    self.supervisor.start(start_block).await?;
                    block_at_launch = last_block;
                    *restarts += 1;
                    self.set_phase(OperatorPhase::Running);
                }
            }
        }
    }

    /// Lets the reader consume what a dead process printed, so resume point
    /// and progress see every block it produced.
    async fn catch_up_reader(&self, pipeline: &Pipeline) {
        let caught_up = async {
            while !self.records_rx.is_empty() && !pipeline.reader.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(self.stop_grace, caught_up).await.is_err() {
            warn!(pending = self.records_rx.len(), "Block reader is lagging behind node output");
        }
    }

    /// Stops the reader, lets the server flush within the shutdown delay and
    /// terminates the node. Returns the last block forwarded downstream.
    async fn drain(&mut self, pipeline: &mut Pipeline) -> Option<u64> {
        let deadline = Instant::now() + self.shutdown_delay;

        if !pipeline.reader_done {
            if let Some(shutdown_tx) = pipeline.reader_shutdown_tx.take() {
                _ = shutdown_tx.send(());
            }
            match (&mut pipeline.reader).await {
                Ok(Ok(exit)) => debug!(?exit, "Block reader drained"),
                Ok(Err(err)) => warn!(%err, "Block reader failed while draining"),
                Err(err) => warn!(%err, "Block reader task failed while draining"),
            }
            pipeline.reader_done = true;
        }

        match tokio::time::timeout_at(deadline, &mut pipeline.server).await {
            Ok(Ok(served)) => debug!(served, "Block stream server flushed"),
            Ok(Err(err)) => warn!(%err, "Block stream server task failed"),
            Err(_) => {
                warn!(delay_ms = self.shutdown_delay.as_millis() as u64, "Block stream server did not flush within the shutdown delay");
                pipeline.server.abort();
            }
        }
        tokio::time::sleep_until(deadline).await;

        match self.supervisor.stop(self.stop_grace).await {
            Ok(exit) if exit.forced => warn!(%exit, "Node process had to be killed"),
            Ok(exit) => info!(%exit, "Node process terminated"),
            Err(SupervisorError::NotRunning) => debug!("Node process already stopped"),
            Err(err) => error!(%err, "Failed to stop node process"),
        }
        self.supervisor.last_block_seen()
    }
}
