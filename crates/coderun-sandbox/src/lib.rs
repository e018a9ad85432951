//! Coderun Sandbox - Process Runner
//!
//! Compiles a source payload inside a private workspace and runs the result
//! as a supervised child process:
//! - Runner: workspace materialization, build step, spawn
//! - Handle: stdin writer, ordered output stream, terminate/wait
//! - Runtime: container isolation (Docker, Apple Container) or native dev mode
//! - Limits: wall-clock timeout, output cap, memory/CPU/PID limits

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
mod handle;
mod invocation;
pub mod language;
mod limits;
mod mount;
mod output;
mod process;
mod runner;
mod runtime;
mod status;
mod workspace;


pub use config::{NetworkMode, SandboxConfig};
pub use error::{Error, Result};
pub use handle::{RunHandle, INPUT_QUEUE_LINES};
pub use language::LanguageProfile;
pub use limits::ResourceLimits;
pub use mount::Mount;
pub use output::{OutputChunk, OutputStream, StreamKind};
pub use runner::{ProcessRunner, StartRequest};
pub use runtime::ContainerRuntime;
pub use status::RunStatus;
