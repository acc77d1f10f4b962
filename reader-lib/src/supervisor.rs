mod node_log;
mod process;

use crate::node_args::{build_node_arguments, NodeArgsError};
use crate::readiness::HeadObserver;
pub use node_log::*;
use parking_lot::Mutex;
pub use process::*;
use protocol::is_record_line;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the supervisor hands to the reader, in process output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutput {
    /// A fresh process was launched at `start_block`; older blocks may be
    /// replayed before new ones appear.
    Launched { start_block: u64 },
    Record(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("node process is already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },
    #[error("node process is not running")]
    NotRunning,
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Arguments(#[from] NodeArgsError),
    #[error("node process monitor failed: {0}")]
    Monitor(String),
}

#[derive(Debug, Clone, bon::Builder)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub working_dir: PathBuf,
    pub node_data_dir: PathBuf,
    pub config_file: PathBuf,
    #[builder(default = "reader".to_string())]
    pub role: String,
    /// Raw argument override, see [`build_node_arguments`]
    #[builder(default)]
    pub arguments: String,
    /// Reclassify non-record node output by level, otherwise pass it
    /// through verbatim at info
    #[builder(default = true)]
    pub log_to_tracing: bool,
    #[builder(default)]
    pub debug_block_logs: bool,
}

/// State shared between the supervisor, its process monitor and the reader.
#[derive(Debug, Default)]
pub struct ProcessState {
    running: AtomicBool,
    last_block_seen: Mutex<Option<u64>>,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_block_seen(&self) -> Option<u64> {
        *self.last_block_seen.lock()
    }
}

impl HeadObserver for ProcessState {
    fn set_last_block_seen(&self, block_num: u64, _block_time: SystemTime) {
        *self.last_block_seen.lock() = Some(block_num);
    }
}

struct RunningProcess {
    pid: Option<u32>,
    stop_tx: oneshot::Sender<Duration>,
    monitor: JoinHandle<std::io::Result<ProcessExit>>,
    forwarder: JoinHandle<()>,
}

/// Owns the lifecycle of the chain node child process.
pub struct Supervisor {
    launcher: Arc<dyn ProcessLauncher>,
    config: SupervisorConfig,
    records_tx: flume::Sender<NodeOutput>,
    exit_tx: flume::Sender<ProcessExit>,
    exit_rx: flume::Receiver<ProcessExit>,
    state: Arc<ProcessState>,
    running: Option<RunningProcess>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        config: SupervisorConfig,
        records_tx: flume::Sender<NodeOutput>,
    ) -> Self {
        let (exit_tx, exit_rx) = flume::unbounded();
        Self {
            launcher,
            config,
            records_tx,
            exit_tx,
            exit_rx,
            state: Arc::new(ProcessState::default()),
            running: None,
        }
    }

    /// Unexpected exits of the node process, one per launch.
    pub fn exits(&self) -> flume::Receiver<ProcessExit> {
        self.exit_rx.clone()
    }

    pub fn process_state(&self) -> Arc<ProcessState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn last_block_seen(&self) -> Option<u64> {
        self.state.last_block_seen()
    }

    pub fn set_last_block_seen(&self, block_num: u64) {
        *self.state.last_block_seen.lock() = Some(block_num);
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|running| running.pid)
    }

    pub async fn start(&mut self, start_block: u64) -> Result<(), SupervisorError> {
        if self.state.is_running() {
            return Err(SupervisorError::AlreadyRunning { pid: self.pid() });
        }
        // a process that exited on its own still has output to hand over
        if let Some(previous) = self.running.take() {
            Self::reap(previous, Duration::ZERO).await?;
        }

        let args = build_node_arguments(
            &self.config.role,
            &self.config.node_data_dir,
            &self.config.config_file,
            &self.config.arguments,
            start_block,
        )?;
        let spec = LaunchSpec {
            program: self.config.program.clone(),
            args,
            working_dir: self.config.working_dir.clone(),
        };
        info!(program = %spec.program.display(), args = ?spec.args, start_block, "Launching node process");

        let launched = self
            .launcher
            .launch(&spec)
            .map_err(|source| SupervisorError::Launch {
                program: spec.program.clone(),
                source,
            })?;
        self.state.running.store(true, Ordering::Release);
        info!(pid = ?launched.pid, "Node process started");

        _ = self
            .records_tx
            .send_async(NodeOutput::Launched { start_block })
            .await
            .inspect_err(|_| warn!("Record receiver dropped before launch notice"));

        let forwarder = tokio::spawn(forward_output(
            launched.output,
            self.records_tx.clone(),
            self.config.log_to_tracing,
            self.config.debug_block_logs,
        ));
        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            launched.process,
            stop_rx,
            self.state.clone(),
            self.exit_tx.clone(),
        ));
        self.running = Some(RunningProcess {
            pid: launched.pid,
            stop_tx,
            monitor,
            forwarder,
        });
        Ok(())
    }

    /// Terminates the node, escalating to a kill once `grace` has elapsed.
    ///
    /// Also collects a process that already exited on its own.
    pub async fn stop(&mut self, grace: Duration) -> Result<ProcessExit, SupervisorError> {
        let running = self.running.take().ok_or(SupervisorError::NotRunning)?;
        info!(pid = ?running.pid, grace_secs = grace.as_secs_f64(), "Stopping node process");
        Self::reap(running, grace).await
    }

    async fn reap(running: RunningProcess, grace: Duration) -> Result<ProcessExit, SupervisorError> {
        // the monitor is gone already if the process exited on its own
        _ = running.stop_tx.send(grace);
        let exit = running
            .monitor
            .await
            .map_err(|err| SupervisorError::Monitor(err.to_string()))?
            .map_err(|err| SupervisorError::Monitor(err.to_string()))?;

        let mut forwarder = running.forwarder;
        if tokio::time::timeout(grace.max(Duration::from_secs(1)), &mut forwarder)
            .await
            .is_err()
        {
            warn!("Node output still open after exit, dropping the remainder");
            forwarder.abort();
        }
        info!(pid = ?running.pid, %exit, "Node process stopped");
        Ok(exit)
    }
}

enum MonitorEvent {
    Exited(std::io::Result<ProcessExit>),
    Stop(Duration),
}

async fn monitor(
    mut process: Box<dyn NodeProcess>,
    stop_rx: oneshot::Receiver<Duration>,
    state: Arc<ProcessState>,
    exit_tx: flume::Sender<ProcessExit>,
) -> std::io::Result<ProcessExit> {
    let event = tokio::select! {
        biased;
        grace = stop_rx => MonitorEvent::Stop(grace.unwrap_or_default()),
        status = process.wait() => MonitorEvent::Exited(status),
    };

    match event {
        MonitorEvent::Exited(status) => {
            state.running.store(false, Ordering::Release);
            let exit = status?;
            warn!(%exit, "Node process exited unexpectedly");
            _ = exit_tx
                .send(exit)
                .inspect_err(|_| error!("Exit receiver dropped"));
            Ok(exit)
        }
        MonitorEvent::Stop(grace) => {
            let exit = shutdown_process(process.as_mut(), grace).await;
            state.running.store(false, Ordering::Release);
            exit
        }
    }
}

async fn shutdown_process(
    process: &mut dyn NodeProcess,
    grace: Duration,
) -> std::io::Result<ProcessExit> {
    match process.terminate() {
        Ok(()) => match tokio::time::timeout(grace, process.wait()).await {
            Ok(exit) => return exit,
            Err(_) => warn!(
                grace_secs = grace.as_secs_f64(),
                "Node process ignored termination request, killing"
            ),
        },
        Err(err) => warn!(%err, "Failed to request node termination, killing"),
    }
    process.kill().await?;
    let mut exit = process.wait().await?;
    exit.forced = true;
    Ok(exit)
}

async fn forward_output(
    output: flume::Receiver<OutputLine>,
    records_tx: flume::Sender<NodeOutput>,
    log_to_tracing: bool,
    debug_block_logs: bool,
) {
    let mut records_open = true;
    while let Ok(line) = output.recv_async().await {
        let line = match line {
            OutputLine::Stdout(line) if is_record_line(&line) => {
                if debug_block_logs {
                    debug!(target: NODE_LOG_TARGET, len = line.len(), "{}", truncate(&line, 64));
                }
                // keep draining so the node never blocks on a full pipe
                if records_open && records_tx.send_async(NodeOutput::Record(line)).await.is_err() {
                    warn!("Record receiver dropped, discarding further node records");
                    records_open = false;
                }
                continue;
            }
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        };
        if log_to_tracing {
            NodeLogLine::parse(&line).emit();
        } else {
            info!(target: NODE_LOG_TARGET, "{line}");
        }
    }
    debug!("Node output closed");
}

fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use tokio::sync::watch;

    /// How a fake process reacts to a termination request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum OnTerminate {
        Exit,
        Ignore,
    }

    /// A scripted launch: output to emit and how the process ends.
    #[derive(Debug, Clone)]
    pub(crate) struct Script {
        pub(crate) lines: Vec<OutputLine>,
        /// Exit with this code after the output, otherwise run until stopped
        pub(crate) exit_code: Option<i32>,
        pub(crate) on_terminate: OnTerminate,
    }

    impl Script {
        pub(crate) fn running(lines: Vec<OutputLine>) -> Self {
            Self {
                lines,
                exit_code: None,
                on_terminate: OnTerminate::Exit,
            }
        }

        pub(crate) fn crashing(lines: Vec<OutputLine>, code: i32) -> Self {
            Self {
                lines,
                exit_code: Some(code),
                on_terminate: OnTerminate::Exit,
            }
        }
    }

    pub(crate) struct FakeLauncher {
        scripts: Mutex<VecDeque<Script>>,
        pub(crate) launches: Mutex<Vec<(tokio::time::Instant, LaunchSpec)>>,
    }

    impl FakeLauncher {
        pub(crate) fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                launches: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn launch_count(&self) -> usize {
            self.launches.lock().len()
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> io::Result<LaunchedProcess> {
            self.launches
                .lock()
                .push((tokio::time::Instant::now(), spec.clone()));
            let script = self
                .scripts
                .lock()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no script left"))?;

            let (output_tx, output_rx) = flume::unbounded();
            for line in script.lines {
                _ = output_tx.send(line);
            }
            let (exit_tx, exit_rx) = watch::channel(None);
            if let Some(code) = script.exit_code {
                _ = exit_tx.send(Some(ProcessExit {
                    code: Some(code),
                    signal: None,
                    forced: false,
                }));
            }
            Ok(LaunchedProcess {
                pid: Some(4242),
                process: Box::new(FakeProcess {
                    on_terminate: script.on_terminate,
                    exit_tx,
                    exit_rx,
                    output_tx: Some(output_tx),
                }),
                output: output_rx,
            })
        }
    }

    struct FakeProcess {
        on_terminate: OnTerminate,
        exit_tx: watch::Sender<Option<ProcessExit>>,
        exit_rx: watch::Receiver<Option<ProcessExit>>,
        output_tx: Option<flume::Sender<OutputLine>>,
    }

    #[async_trait]
    impl NodeProcess for FakeProcess {
        fn terminate(&mut self) -> io::Result<()> {
            if self.on_terminate == OnTerminate::Exit {
                _ = self.exit_tx.send(Some(ProcessExit {
                    code: None,
                    signal: Some(15),
                    forced: false,
                }));
            }
            Ok(())
        }

        async fn kill(&mut self) -> io::Result<()> {
            _ = self.exit_tx.send(Some(ProcessExit {
                code: None,
                signal: Some(9),
                forced: false,
            }));
            Ok(())
        }

        async fn wait(&mut self) -> io::Result<ProcessExit> {
            let exit = self
                .exit_rx
                .wait_for(Option::is_some)
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))?
                .unwrap_or(ProcessExit {
                    code: None,
                    signal: None,
                    forced: false,
                });
            // a dead process closes its pipes
            self.output_tx = None;
            Ok(exit)
        }
    }

    pub(crate) fn config() -> SupervisorConfig {
        SupervisorConfig::builder()
            .program(PathBuf::from("sui-node"))
            .working_dir(PathBuf::from("/tmp"))
            .node_data_dir(PathBuf::from("/data/reader/data"))
            .config_file(PathBuf::from("/data/reader/data/node.yaml"))
            .build()
    }

    fn stdout(line: &str) -> OutputLine {
        OutputLine::Stdout(line.to_string())
    }

    #[tokio::test]
    async fn test_start_forwards_records_only() {
        let launcher = FakeLauncher::new(vec![Script::running(vec![
            stdout("2024-03-01T10:00:00Z INFO booting"),
            stdout("FIRE INIT 1.0 sui-1.22"),
            OutputLine::Stderr("FIRE BLOCK 00".to_string()),
            stdout("FIRE BLOCK abcd"),
        ])]);
        let (records_tx, records_rx) = flume::unbounded();
        let mut supervisor = Supervisor::new(launcher.clone(), config(), records_tx);

        supervisor.start(150).await.unwrap();
        assert!(supervisor.is_running());
        assert_eq!(
            records_rx.recv_async().await.unwrap(),
            NodeOutput::Launched { start_block: 150 }
        );
        assert_eq!(
            records_rx.recv_async().await.unwrap(),
            NodeOutput::Record("FIRE INIT 1.0 sui-1.22".to_string())
        );
        assert_eq!(
            records_rx.recv_async().await.unwrap(),
            NodeOutput::Record("FIRE BLOCK abcd".to_string())
        );

        let args = launcher.launches.lock()[0].1.args.clone();
        assert_eq!(args[args.len() - 2..], ["--start-checkpoint", "150"]);

        let exit = supervisor.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!exit.forced);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let launcher = FakeLauncher::new(vec![Script::running(vec![]), Script::running(vec![])]);
        let (records_tx, _records_rx) = flume::unbounded();
        let mut supervisor = Supervisor::new(launcher.clone(), config(), records_tx);

        supervisor.start(0).await.unwrap();
        assert!(matches!(
            supervisor.start(0).await,
            Err(SupervisorError::AlreadyRunning { pid: Some(4242) })
        ));
        assert_eq!(launcher.launch_count(), 1);
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let (records_tx, _records_rx) = flume::unbounded();
        let mut supervisor = Supervisor::new(FakeLauncher::new(Vec::new()), config(), records_tx);
        assert!(matches!(
            supervisor.stop(Duration::from_secs(1)).await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_kills_after_grace() {
        let launcher = FakeLauncher::new(vec![Script {
            lines: vec![],
            exit_code: None,
            on_terminate: OnTerminate::Ignore,
        }]);
        let (records_tx, _records_rx) = flume::unbounded();
        let mut supervisor = Supervisor::new(launcher, config(), records_tx);
        supervisor.start(0).await.unwrap();

        let started = tokio::time::Instant::now();
        let exit = supervisor.stop(Duration::from_secs(3)).await.unwrap();
        assert!(exit.forced);
        assert_eq!(exit.signal, Some(9));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let launcher = FakeLauncher::new(vec![
            Script::crashing(vec![stdout("FIRE BLOCK 01")], 1),
            Script::running(vec![]),
        ]);
        let (records_tx, records_rx) = flume::unbounded();
        let mut supervisor = Supervisor::new(launcher, config(), records_tx);
        let exits = supervisor.exits();

        supervisor.start(10).await.unwrap();
        let exit = exits.recv_async().await.unwrap();
        assert_eq!(exit.code, Some(1));
        assert!(!supervisor.is_running());

        // restart collects the dead process first, keeping output ordered
        supervisor.start(11).await.unwrap();
        let received: Vec<_> = records_rx.drain().collect();
        assert_eq!(
            received,
            vec![
                NodeOutput::Launched { start_block: 10 },
                NodeOutput::Record("FIRE BLOCK 01".to_string()),
                NodeOutput::Launched { start_block: 11 },
            ]
        );
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn test_last_block_seen() {
        let (records_tx, _records_rx) = flume::unbounded();
        let supervisor = Supervisor::new(FakeLauncher::new(Vec::new()), config(), records_tx);
        assert_eq!(supervisor.last_block_seen(), None);
        supervisor.set_last_block_seen(12);
        supervisor
            .process_state()
            .set_last_block_seen(13, SystemTime::UNIX_EPOCH);
        assert_eq!(supervisor.last_block_seen(), Some(13));
    }
}
