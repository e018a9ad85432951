//! WebSocket module for coderun
//!
//! Provides the real-time endpoint:
//! - /ws/run - one interactive code-execution session per connection

pub mod gateway;
pub mod protocol;

pub use gateway::gateway_handler;

use axum::{routing::get, Router};

/// Create the WebSocket router
pub fn websocket_router() -> Router {
    Router::new().route("/ws/run", get(gateway_handler))
}
