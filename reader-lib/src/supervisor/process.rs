use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The process had to be killed after ignoring the termination request
    pub forced: bool,
}

impl ProcessExit {
    pub fn from_status(status: ExitStatus, forced: bool) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            forced,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}")?,
            (None, Some(signal)) => write!(f, "signal {signal}")?,
            (None, None) => write!(f, "unknown status")?,
        }
        if self.forced {
            write!(f, " (killed)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub process: Box<dyn NodeProcess>,
    /// Closed once both output streams of the process are exhausted
    pub output: flume::Receiver<OutputLine>,
}

/// Lifecycle primitives of one running child.
#[async_trait]
pub trait NodeProcess: Send {
    /// Asks the process to exit on its own.
    fn terminate(&mut self) -> io::Result<()>;

    async fn kill(&mut self) -> io::Result<()>;

    async fn wait(&mut self) -> io::Result<ProcessExit>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<LaunchedProcess>;
}

/// Spawns real OS processes with piped output.
pub struct OsProcessLauncher {
    output_capacity: usize,
}

impl OsProcessLauncher {
    pub fn new(output_capacity: usize) -> Self {
        Self { output_capacity }
    }
}

impl Default for OsProcessLauncher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ProcessLauncher for OsProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<LaunchedProcess> {
        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (output_tx, output_rx) = flume::bounded(self.output_capacity);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, output_tx.clone(), OutputLine::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, output_tx, OutputLine::Stderr));
        }

        Ok(LaunchedProcess {
            pid: child.id(),
            process: Box::new(OsProcess { child }),
            output: output_rx,
        })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    output_tx: flume::Sender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                // node output is not guaranteed to be utf-8, a bad byte must not end the stream
                let line = String::from_utf8_lossy(trim_line_end(&buf)).into_owned();
                if output_tx.send_async(wrap(line)).await.is_err() {
                    debug!("Output receiver dropped, no longer reading process output");
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "Error reading process output");
                return;
            }
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

struct OsProcess {
    child: tokio::process::Child,
}

#[async_trait]
impl NodeProcess for OsProcess {
    fn terminate(&mut self) -> io::Result<()> {
        // no pid means the child has already been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)?;
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit::from_status(status, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_os_process_output_and_exit() {
        let launched = OsProcessLauncher::default()
            .launch(&sh("echo out; echo err 1>&2; exit 3"))
            .unwrap();
        let mut process = launched.process;
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.forced);

        let mut lines: Vec<_> = launched.output.into_stream().collect().await;
        lines.sort_by_key(|line| matches!(line, OutputLine::Stderr(_)));
        assert_eq!(
            lines,
            vec![
                OutputLine::Stdout("out".to_string()),
                OutputLine::Stderr("err".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_os_process_terminate() {
        let launched = OsProcessLauncher::default().launch(&sh("sleep 30")).unwrap();
        let mut process = launched.process;
        process.terminate().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.signal, Some(Signal::SIGTERM as i32));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_output() {
        let launched = OsProcessLauncher::default()
            .launch(&sh("printf 'bad \\377 line\\r\\n'; echo 'FIRE INIT 1.0 after'; printf 'no newline'"))
            .unwrap();
        let mut process = launched.process;
        let exit = process.wait().await.unwrap();
        assert!(exit.success());

        let lines: Vec<_> = launched.output.into_stream().collect().await;
        assert_eq!(
            lines,
            vec![
                OutputLine::Stdout("bad \u{FFFD} line".to_string()),
                OutputLine::Stdout("FIRE INIT 1.0 after".to_string()),
                OutputLine::Stdout("no newline".to_string()),
            ]
        );
    }
}
