//! Coderun Core - Sessions
//!
//! - Session Manager: one coordinator task per client session, owning at
//!   most one live run and relaying its output as ordered events
//! - Auth: hashed API keys and scopes
//! - Shutdown: phased graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod error;
pub mod event;
mod rate_limit;
pub mod session;
pub mod session_manager;
pub mod shutdown;

pub use auth::{
    admin_scopes, default_user_scopes, ApiKeyInfo, AuthContext, AuthError, AuthMethod, AuthStore,
    Scope,
};
pub use error::{Error, Result};
pub use event::{SessionEvent, SessionEvents};
pub use session::{SessionSnapshot, SessionState, SessionSummary};
pub use session_manager::{SessionConfig, SessionManager};
pub use shutdown::{wait_for_shutdown_signal, ShutdownController, ShutdownPhase, TaskGuard};
