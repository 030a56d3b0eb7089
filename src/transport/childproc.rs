//! Child process transport for MCP
//!
//! Spawns an MCP server as a subprocess and exchanges newline-delimited
//! JSON-RPC over its stdin/stdout.
//!
//! Two background pumps run while the transport is up:
//!
//! - a **reader** that splits stdout into lines, decodes each line as a
//!   single message or a batch, and forwards every valid message to the
//!   inbound queue. A bad line is logged and skipped.
//! - a **writer** that drains the outbound queue, writing one compact JSON
//!   line per message, and closes the child's stdin when it exits.
//!
//! [`stop`](Transport::stop) closes stdin, aborts the pumps, then sends
//! `SIGTERM` and finally `SIGKILL`, each with a bounded wait.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_conduit::{ClientConfig, McpClient};
//! use mcp_conduit::transport::ChildProcessTransport;
//!
//! # async fn run() -> mcp_conduit::Result<()> {
//! let transport = ChildProcessTransport::new("my-mcp-server").arg("--stdio");
//! let mut client = McpClient::connect(transport, ClientConfig::default()).await?;
//! client.initialize().await?;
//! let tools = client.list_tools().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{DEFAULT_CHANNEL_CAPACITY, Transport, TransportState, TransportStreams, begin_start};
use crate::codec;
use crate::error::{Error, Result};
use crate::protocol::JsonRpcMessage;

/// Default wait after `SIGTERM` before the child is killed.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait after `SIGKILL` before giving up on reaping the child.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Client transport speaking to a spawned child process over stdio.
pub struct ChildProcessTransport {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    terminate_timeout: Duration,
    log_stderr: bool,
    state: TransportState,
    running: Option<Running>,
}

struct Running {
    child: Child,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ChildProcessTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            log_stderr: false,
            state: TransportState::NotStarted,
            running: None,
        }
    }

    /// Add a command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple command-line arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run the child in `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// How long to wait after `SIGTERM` before killing the child.
    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Pipe the child's stderr into `tracing` instead of inheriting it.
    pub fn log_stderr(mut self) -> Self {
        self.log_stderr = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.child.id())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if self.log_stderr {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);

        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn spawn(&mut self) -> Result<TransportStreams> {
        let mut child = self.command().spawn().map_err(|e| {
            Error::Connection(format!("Failed to spawn {}: {}", self.program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("Failed to get child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("Failed to get child stdout".to_string()))?;

        tracing::info!(program = %self.program, pid = ?child.id(), "Spawned child process");

        let (in_tx, in_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let program = self.program.clone();
        let reader = tokio::spawn(read_stdout(stdout, in_tx, program.clone()));
        let writer = tokio::spawn(write_stdin(stdin, out_rx, shutdown_rx, program.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, program)));

        self.running = Some(Running {
            child,
            reader,
            writer,
            stderr,
            shutdown: Some(shutdown_tx),
        });

        Ok(TransportStreams {
            inbound: in_rx,
            outbound: out_tx,
        })
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    async fn start(&mut self) -> Result<TransportStreams> {
        begin_start(&mut self.state)?;
        match self.spawn().await {
            Ok(streams) => {
                self.state = TransportState::Running;
                Ok(streams)
            }
            Err(e) => {
                self.state = TransportState::Stopped;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            self.state = TransportState::Stopped;
            return;
        };
        self.state = TransportState::Stopping;
        tracing::debug!(program = %self.program, "Stopping child process transport");

        // Let the writer close stdin so a well-behaved child sees EOF.
        if let Some(shutdown) = running.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(Duration::from_millis(500), &mut running.writer)
            .await
            .is_err()
        {
            tracing::warn!(program = %self.program, "Stdin writer did not finish, aborting");
            running.writer.abort();
        }
        running.reader.abort();
        if let Some(stderr) = &running.stderr {
            stderr.abort();
        }

        terminate(&mut running.child, &self.program, self.terminate_timeout).await;
        self.state = TransportState::Stopped;
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

impl Drop for ChildProcessTransport {
    fn drop(&mut self) {
        // The child itself is killed by `kill_on_drop`.
        if let Some(running) = self.running.take() {
            running.reader.abort();
            running.writer.abort();
            if let Some(stderr) = running.stderr {
                stderr.abort();
            }
        }
    }
}

async fn read_stdout(stdout: ChildStdout, inbound: mpsc::Sender<JsonRpcMessage>, program: String) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                tracing::info!(program = %program, "Child process closed stdout");
                break;
            }
            Ok(_) => {
                if codec::trim_ascii(&line).is_empty() {
                    continue;
                }
                tracing::trace!(line = %String::from_utf8_lossy(&line).trim_end(), "Received line from child");

                let frame = match codec::decode_frame_bytes(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(program = %program, error = %e, "Skipping undecodable line");
                        continue;
                    }
                };
                for message in frame.into_messages() {
                    if inbound.send(message).await.is_err() {
                        tracing::debug!("Inbound receiver dropped, stopping reader");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(program = %program, error = %e, "Failed to read from child stdout");
                break;
            }
        }
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    mut shutdown: oneshot::Receiver<()>,
    program: String,
) {
    loop {
        let message = tokio::select! {
            _ = &mut shutdown => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let bytes = match codec::encode_line(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode outbound message");
                continue;
            }
        };
        if let Err(e) = write_line(&mut stdin, &bytes).await {
            tracing::error!(program = %program, error = %e, "Failed to write to child stdin");
            break;
        }
    }

    // Dropping stdin signals EOF to the child.
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(error = %e, "Error closing child stdin");
    }
    tracing::debug!(program = %program, "Stdin writer finished");
}

async fn write_line(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

async fn forward_stderr(stderr: tokio::process::ChildStderr, program: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(program = %program, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Error reading child stderr");
                break;
            }
        }
    }
}

/// Graceful then forceful termination. Errors are logged, never returned.
async fn terminate(child: &mut Child, program: &str, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::info!(program = %program, status = ?status, "Child process exited");
            return;
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(program = %program, error = %e, "Failed to poll child process"),
    }

    if let Err(e) = send_terminate(child) {
        tracing::warn!(program = %program, error = %e, "Failed to send SIGTERM");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(program = %program, status = ?status, "Child process exited");
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!(program = %program, error = %e, "Error waiting for child process");
        }
        Err(_) => {
            tracing::warn!(program = %program, "Child process did not exit gracefully, killing");
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::warn!(program = %program, error = %e, "Failed to kill child process");
        return;
    }
    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(program = %program, status = ?status, "Child process killed"),
        Ok(Err(e)) => tracing::warn!(program = %program, error = %e, "Error reaping killed child"),
        Err(_) => tracing::error!(program = %program, "Child process survived SIGKILL"),
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}
