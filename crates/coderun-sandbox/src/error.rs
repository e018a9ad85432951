//! Error types for coderun-sandbox

use thiserror::Error;

/// Process runner error type
#[derive(Debug, Error)]
pub enum Error {
    /// The build step exited non-zero; no process was spawned
    #[error("compilation failed (exit code {exit_code:?})")]
    Compile {
        /// Compiler diagnostics (stdout and stderr, capped)
        diagnostics: String,
        /// Compiler exit code, if it exited normally
        exit_code: Option<i32>,
    },

    /// Input or cancel issued after the process exited
    #[error("process is no longer running")]
    ProcessGone,

    /// Too many lines are waiting for the program to read its stdin
    #[error("stdin backlog full ({limit} lines)")]
    InputBacklog {
        /// Queue capacity in lines
        limit: usize,
    },

    /// A phase exceeded its time budget
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// The start request was cancelled before the process was spawned
    #[error("start cancelled")]
    Cancelled,

    /// Spawning the compiler or the program failed
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Workspace could not be created or written
    #[error("workspace error: {0}")]
    Workspace(String),

    /// No language profile with this name is configured
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// The configured isolation runtime cannot be used
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
