//! Server module for coderun
//!
//! Contains the main server initialization and runtime logic.
//!
//! # Module Structure
//!
//! - `config`: Configuration structures for all server components
//! - `loader`: Configuration loading from files and environment
//! - `validation`: Production configuration validation
//! - `init`: Main server initialization and run loop

pub mod config;
mod init;
mod loader;
mod validation;

// Re-export public API
pub use init::{build_router, init_auth, run, AppState};
pub use loader::{environment, load_config};
pub use validation::validate_production_config;
