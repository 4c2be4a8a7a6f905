//! Scripted [`WorkerLink`] for exercising the protocol without a process.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::bytes::Bytes;

use crate::bridge::protocol::Command;
use crate::mux::{MuxEvent, Source, WorkerLink};
use crate::supervisor::WorkerState;

/// Plays back a fixed sequence of worker output and records what was sent.
///
/// Once the script runs out the link reports `Closed` and switches to the
/// configured exit state.
pub(crate) struct ScriptedLink {
    script: VecDeque<MuxEvent>,
    state: WorkerState,
    exit_state: WorkerState,
    pub lines: Vec<String>,
    pub payloads: Vec<Vec<u8>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            state: WorkerState::Running,
            exit_state: WorkerState::ExitedNormally(1),
            lines: Vec::new(),
            payloads: Vec::new(),
        }
    }

    pub fn stdout(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.script.push_back(MuxEvent::Data(
            Source::Payload,
            Bytes::copy_from_slice(bytes.as_ref()),
        ));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.script.push_back(MuxEvent::Data(
            Source::Diagnostic,
            Bytes::copy_from_slice(text.as_bytes()),
        ));
        self
    }

    /// stdout reaches EOF while the worker stays alive.
    pub fn closes_payload(mut self) -> Self {
        self.script.push_back(MuxEvent::PayloadClosed);
        self
    }

    pub fn stall(mut self) -> Self {
        self.script.push_back(MuxEvent::TimedOut);
        self
    }

    pub fn exits_with(mut self, state: WorkerState) -> Self {
        self.exit_state = state;
        self
    }

    fn check_open(&self) -> io::Result<()> {
        if self.state.is_running() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))
        }
    }
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLink for ScriptedLink {
    async fn send_command(&mut self, command: Command) -> io::Result<()> {
        self.check_open()?;
        self.lines.push(command.to_line());
        Ok(())
    }

    async fn send_payload(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.check_open()?;
        self.payloads.push(bytes.to_vec());
        Ok(())
    }

    async fn wait_for_data(&mut self, _timeout: Option<Duration>) -> MuxEvent {
        match self.script.pop_front() {
            Some(MuxEvent::TimedOut) => {
                self.state = WorkerState::Timeout;
                MuxEvent::TimedOut
            }
            Some(event) => event,
            None => {
                self.state = self.exit_state.clone();
                MuxEvent::Closed
            }
        }
    }

    fn state(&mut self) -> WorkerState {
        self.state.clone()
    }
}
