//! Worker process lifecycle.
//!
//! The supervisor owns at most one worker. It spawns lazily, reports the run
//! state on demand and tears the process down on request. A worker that died
//! is replaced the next time [`Supervisor::ensure_running`] is called.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::CommandCodec;
use crate::bridge::protocol::Command;
use crate::config::{BridgeConfig, WorkerCommand};
use crate::error::SpawnError;
use crate::mux::{MuxEvent, Source, StreamMux, WorkerLink};

/// How long to collect stderr from a worker that died during startup.
const STARTUP_DIAGNOSTICS_WAIT: Duration = Duration::from_millis(500);

/// How long a worker that closed stdout gets to finish stderr and exit.
const PAYLOAD_EOF_GRACE: Duration = Duration::from_millis(500);

/// Run state of the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Running,
    /// Exited on its own with an exit code (zero or not).
    ExitedNormally(i32),
    /// The exit status could not be determined.
    ExitedWithError(String),
    /// Terminated by a signal it did not receive from us.
    Crashed(String),
    Killed,
    /// Still alive but stopped answering within the response timeout.
    Timeout,
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    fn from_exit(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::ExitedNormally(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Crashed(format!("terminated by signal {signal}"));
            }
        }
        Self::Crashed(status.to_string())
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Running => f.write_str("running"),
            Self::ExitedNormally(code) => write!(f, "exited with code {code}"),
            Self::ExitedWithError(msg) => write!(f, "exited with error: {msg}"),
            Self::Crashed(msg) => write!(f, "crashed: {msg}"),
            Self::Killed => f.write_str("killed"),
            Self::Timeout => f.write_str("timed out"),
        }
    }
}

/// A spawned worker with its three pipes.
pub struct WorkerProcess {
    child: Child,
    /// `None` once stdin has been released.
    writer: Option<FramedWrite<ChildStdin, CommandCodec>>,
    mux: StreamMux<ChildStdout, ChildStderr>,
    killed: bool,
    timed_out: bool,
    /// Set when stdout first reports EOF.
    payload_eof_deadline: Option<Instant>,
}

impl WorkerProcess {
    async fn spawn(command: &WorkerCommand, read_buffer_size: usize) -> Result<Self, SpawnError> {
        let launch_error = |source: io::Error| SpawnError::Launch {
            program: command.program.clone(),
            source,
        };

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_error(io::Error::other("stderr not captured")))?;

        tracing::info!(program = %command.program, pid = ?child.id(), "Worker spawned");

        Ok(Self {
            child,
            writer: Some(FramedWrite::new(stdin, CommandCodec::new())),
            mux: StreamMux::new(stdout, stderr, read_buffer_size),
            killed: false,
            timed_out: false,
            payload_eof_deadline: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Query the OS for the current state. Reaps the process if it has exited.
    pub fn state(&mut self) -> WorkerState {
        match self.child.try_wait() {
            Ok(None) if self.timed_out => WorkerState::Timeout,
            Ok(None) => WorkerState::Running,
            Ok(Some(_)) if self.killed => WorkerState::Killed,
            Ok(Some(status)) => WorkerState::from_exit(status),
            Err(e) => WorkerState::ExitedWithError(e.to_string()),
        }
    }

    /// Stop the process if it is alive and release stdin either way.
    ///
    /// On unix the worker gets SIGTERM and `grace` to exit before SIGKILL.
    pub async fn kill(&mut self, grace: Duration) {
        if matches!(self.child.try_wait(), Ok(None)) {
            tracing::debug!(pid = ?self.child.id(), "Stopping worker");
            self.terminate(grace).await;
            self.killed = true;
        }
        self.writer = None;
    }

    async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id()
                && !grace.is_zero()
                && kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                && tokio::time::timeout(grace, self.child.wait()).await.is_ok()
            {
                return;
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill worker");
        }
    }

    /// Collect whatever the worker left on stderr, for at most `limit`.
    async fn drain_diagnostics(&mut self, limit: Duration) -> String {
        let mut collected = Vec::new();
        let _ = tokio::time::timeout(limit, async {
            while let Some((source, bytes)) = self.mux.next_chunk().await {
                if source == Source::Diagnostic {
                    collected.extend_from_slice(&bytes);
                }
            }
        })
        .await;
        String::from_utf8_lossy(&collected).into_owned()
    }

    async fn next_event(&mut self) -> MuxEvent {
        if self.mux.payload_open()
            && let Some((source, bytes)) = self.mux.next_chunk_until_payload_eof().await
        {
            return MuxEvent::Data(source, bytes);
        }

        // stdout is gone; no reply can complete. Collect what is left on
        // stderr and the exit status, but only for a bounded time.
        let deadline = *self
            .payload_eof_deadline
            .get_or_insert_with(|| Instant::now() + PAYLOAD_EOF_GRACE);
        match tokio::time::timeout_at(deadline, self.mux.next_chunk()).await {
            Ok(Some((source, bytes))) => return MuxEvent::Data(source, bytes),
            Ok(None) => {}
            Err(_) => {
                tracing::warn!(pid = ?self.child.id(), "Worker closed stdout but kept running");
                return MuxEvent::PayloadClosed;
            }
        }
        match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Ok(Ok(_)) => MuxEvent::Closed,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to reap worker");
                MuxEvent::Closed
            }
            Err(_) => {
                tracing::warn!(pid = ?self.child.id(), "Worker closed its pipes but kept running");
                MuxEvent::PayloadClosed
            }
        }
    }

    fn writer(&mut self) -> io::Result<&mut FramedWrite<ChildStdin, CommandCodec>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin is closed"))
    }
}

#[async_trait]
impl WorkerLink for WorkerProcess {
    async fn send_command(&mut self, command: Command) -> io::Result<()> {
        self.writer()?.send(command).await
    }

    async fn send_payload(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stdin = self.writer()?.get_mut();
        stdin.write_all(bytes).await?;
        stdin.flush().await
    }

    async fn wait_for_data(&mut self, timeout: Option<Duration>) -> MuxEvent {
        let Some(limit) = timeout else {
            return self.next_event().await;
        };
        match tokio::time::timeout(limit, self.next_event()).await {
            Ok(event) => event,
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Worker response timed out");
                self.timed_out = true;
                MuxEvent::TimedOut
            }
        }
    }

    fn state(&mut self) -> WorkerState {
        WorkerProcess::state(self)
    }
}

/// Owns the worker process across operations.
pub struct Supervisor {
    command: WorkerCommand,
    startup_grace: Duration,
    kill_grace: Duration,
    read_buffer_size: usize,
    worker: Option<WorkerProcess>,
}

impl Supervisor {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            command: config.worker.clone(),
            startup_grace: config.startup_grace,
            kill_grace: config.kill_grace,
            read_buffer_size: config.read_buffer_size,
            worker: None,
        }
    }

    pub fn state(&mut self) -> WorkerState {
        match self.worker.as_mut() {
            Some(worker) => worker.state(),
            None => WorkerState::NotStarted,
        }
    }

    /// Return the running worker, spawning a fresh one if there is none or
    /// the current one is no longer running.
    pub async fn ensure_running(&mut self) -> Result<&mut WorkerProcess, SpawnError> {
        let current = match self.worker.take() {
            Some(mut worker) => {
                let state = worker.state();
                if state.is_running() {
                    Some(worker)
                } else {
                    tracing::info!(%state, "Replacing worker");
                    worker.kill(self.kill_grace).await;
                    None
                }
            }
            None => None,
        };
        let worker = match current {
            Some(worker) => worker,
            None => self.launch().await?,
        };
        Ok(self.worker.insert(worker))
    }

    async fn launch(&self) -> Result<WorkerProcess, SpawnError> {
        let mut worker = WorkerProcess::spawn(&self.command, self.read_buffer_size).await?;

        if !self.startup_grace.is_zero() {
            tokio::time::sleep(self.startup_grace).await;
        }

        let state = worker.state();
        if state.is_running() {
            return Ok(worker);
        }

        let diagnostics = worker.drain_diagnostics(STARTUP_DIAGNOSTICS_WAIT).await;
        tracing::error!(%state, "Worker did not start");
        Err(SpawnError::NotRunning { state, diagnostics })
    }

    /// Stop the worker if it is alive and release its stdin. The handle is
    /// kept, so [`Supervisor::state`] reports [`WorkerState::Killed`].
    pub async fn kill(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            worker.kill(self.kill_grace).await;
        }
    }

    /// Kill and forget the worker.
    pub async fn destroy(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.kill(self.kill_grace).await;
            tracing::debug!("Worker destroyed");
        }
    }
}
