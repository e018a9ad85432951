//! Run lifecycle states

use serde::{Deserialize, Serialize};

/// State of a run
///
/// `Compiling -> Running -> {Exited, Killed, TimedOut}` and
/// `Compiling -> {CompileFailed, Killed}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Build step in progress
    Compiling,
    /// Program is live
    Running,
    /// Program exited on its own; signal deaths are reported as `128 + signal`
    Exited {
        /// Exit code
        code: i32,
    },
    /// Terminated by request (cancel, replacement, disconnect, shutdown)
    Killed,
    /// Wall-clock budget exceeded
    TimedOut,
    /// Build step failed; no program was spawned
    CompileFailed,
}

impl RunStatus {
    /// Whether this state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Compiling | Self::Running)
    }

    /// Exit code, when the program exited on its own
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(*code),
            _ => None,
        }
    }

    /// Lowercase wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compiling => "compiling",
            Self::Running => "running",
            Self::Exited { .. } => "exited",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
            Self::CompileFailed => "compile_failed",
        }
    }

    pub(crate) fn from_exit(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited { code },
            (None, Some(signal)) => Self::Exited { code: 128 + signal },
            (None, None) => Self::Exited { code: -1 },
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}
