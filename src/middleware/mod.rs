//! Middleware module for coderun HTTP server
//!
//! Provides:
//! - Authentication extractors (Bearer token / API key)

pub mod auth;
