//! Events a session emits to its transport

use coderun_sandbox::{OutputChunk, RunStatus};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Receiving side of a session's event channel
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Outbound session event, in the order the coordinator produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The program was spawned and accepts input
    RunStarted {
        /// Run id
        run_id: Uuid,
        /// Language profile
        language: String,
    },
    /// A piece of program output
    Output {
        /// Run id
        run_id: Uuid,
        /// The chunk
        chunk: OutputChunk,
    },
    /// The build step failed (or the run could not be started); nothing was spawned
    CompileError {
        /// Run id
        run_id: Uuid,
        /// Compiler output or failure description
        diagnostics: String,
        /// Compiler exit code
        exit_code: Option<i32>,
    },
    /// A run reached a terminal status
    RunEnded {
        /// Run id
        run_id: Uuid,
        /// Terminal status
        status: RunStatus,
        /// Output bytes forwarded
        output_bytes: usize,
        /// Wall-clock time since the run was requested
        duration_ms: u64,
    },
    /// The run was cancelled on request
    RunCancelled {
        /// Run id
        run_id: Uuid,
    },
    /// An input line was refused because the program is not reading stdin
    InputDropped {
        /// Run id
        run_id: Uuid,
        /// Why the line was dropped
        reason: String,
    },
    /// Input or cancel arrived with nothing running
    NoActiveRun {
        /// Which request was dropped (`input` or `cancel`)
        request: String,
    },
}

impl SessionEvent {
    /// Run this event belongs to
    #[must_use]
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::Output { run_id, .. }
            | Self::CompileError { run_id, .. }
            | Self::RunEnded { run_id, .. }
            | Self::RunCancelled { run_id }
            | Self::InputDropped { run_id, .. } => Some(*run_id),
            Self::NoActiveRun { .. } => None,
        }
    }

    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::Output { .. } => "output",
            Self::CompileError { .. } => "compile_error",
            Self::RunEnded { .. } => "run_ended",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::InputDropped { .. } => "input_dropped",
            Self::NoActiveRun { .. } => "no_active_run",
        }
    }
}
