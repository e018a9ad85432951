//! HTTP API module for coderun
//!
//! Provides the health endpoints and read-only session views; program
//! execution happens over `/ws/run`.

pub mod health;
pub mod sessions;

pub use health::health_routes;
pub use sessions::sessions_routes;
