//! Spawning child bridge processes.
//!
//! A launched child is driven entirely through channels: control messages go
//! in through [`LaunchedProcess::control`], and reports, stderr lines and the
//! final exit come back on [`LaunchedProcess::events`]. Dropping the handle
//! kills the process.

use crate::channel::next_text_line;
use crate::protocol::{decode_line, ChildControl, ChildReport, IpcMessage, IPC_ENV_STDIO, IPC_ENV_VAR};
use async_trait::async_trait;
use bridgehost_core::ChildBridgeEntry;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn child bridge process {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("child bridge process has no {0} pipe")]
    MissingPipe(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Report(ChildReport),
    Stderr(String),
    Exited { code: Option<i32> },
}

/// Handle to one running child.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub control: mpsc::UnboundedSender<ChildControl>,
    pub events: mpsc::Receiver<ProcessEvent>,
    pub kill: oneshot::Sender<()>,
}

impl LaunchedProcess {
    /// Wire up a handle; returns the far ends for whoever plays the child.
    pub fn channels(
        pid: Option<u32>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ChildControl>,
        mpsc::Sender<ProcessEvent>,
        oneshot::Receiver<()>,
    ) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (kill, kill_rx) = oneshot::channel();
        (
            Self {
                pid,
                control,
                events,
                kill,
            },
            control_rx,
            events_tx,
            kill_rx,
        )
    }
}

#[async_trait]
pub trait BridgeLauncher: Send + Sync {
    async fn launch(&self, bridge: &ChildBridgeEntry) -> Result<LaunchedProcess, LaunchError>;
}

/// Runs each child bridge as `<program> [--storage-path <dir>] child --username <USERNAME>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    storage_path: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            storage_path: None,
        }
    }

    /// Re-invoke the running executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    fn command(&self, bridge: &ChildBridgeEntry) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(storage) = &self.storage_path {
            cmd.arg("--storage-path").arg(storage);
        }
        cmd.arg("child")
            .arg("--username")
            .arg(bridge.username.as_str())
            .env(IPC_ENV_VAR, IPC_ENV_STDIO)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl BridgeLauncher for ProcessLauncher {
    async fn launch(&self, bridge: &ChildBridgeEntry) -> Result<LaunchedProcess, LaunchError> {
        let mut child = self
            .command(bridge)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let pid = child.id();
        tracing::info!(username = %bridge.username, pid = ?pid, "child bridge process started");

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

        let (handle, control_rx, events_tx, kill_rx) = LaunchedProcess::channels(pid);
        tokio::spawn(stdin_writer(stdin, control_rx));
        tokio::spawn(stdout_reader(stdout, events_tx.clone()));
        tokio::spawn(stderr_reader(stderr, events_tx.clone()));
        tokio::spawn(wait_for_exit(child, kill_rx, events_tx));

        Ok(handle)
    }
}

async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<ChildControl>) {
    while let Some(control) = rx.recv().await {
        let line = match IpcMessage::from_event(&control).and_then(|m| m.to_line()) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode child control message");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(format!("{line}\n").as_bytes()).await {
            tracing::debug!(error = %e, "child stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!(error = %e, "child stdin flush failed");
            break;
        }
    }
}

async fn stdout_reader(stdout: ChildStdout, tx: mpsc::Sender<ProcessEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    while let Some(line) = next_text_line(&mut reader, &mut buf).await {
        match decode_line::<ChildReport>(&line) {
            Some(report) => {
                if tx.send(ProcessEvent::Report(report)).await.is_err() {
                    break;
                }
            }
            None => tracing::trace!(line = %line, "ignoring non-protocol stdout line"),
        }
    }
}

async fn stderr_reader(stderr: ChildStderr, tx: mpsc::Sender<ProcessEvent>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "child stderr read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if tx.send(ProcessEvent::Stderr(line)).await.is_err() {
            break;
        }
    }
}

/// Owns the child until it exits, either naturally or because `kill_rx` fired
/// (sent, or dropped along with the handle).
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let code = tokio::select! {
        result = child.wait() => match result {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::error!(error = %e, "failed waiting for child bridge");
                None
            }
        },
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "failed to kill child bridge");
            }
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!(error = %e, "failed waiting for killed child bridge");
                    None
                }
            }
        }
    };
    tracing::debug!(code = ?code, "child bridge process exited");
    let _ = tx.send(ProcessEvent::Exited { code }).await;
}
