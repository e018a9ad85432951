//! Run WebSocket handler.
//!
//! Authenticated WebSocket endpoint with request/response/event framing.
//!
//! Flow:
//! 1. Client sends `connect` Request with its API key
//! 2. Server validates the key and opens one session for the connection
//! 3. Client drives the session with `run`, `input`, `cancel`, `status`, `transcript`
//! 4. Server streams the session's events as Event frames
//! 5. Closing the socket terminates the session's run and releases the session

pub mod connection;
mod dispatch;
pub(crate) mod events;


pub use events::convert_event;

use axum::{extract::ws::WebSocketUpgrade, response::IntoResponse, Extension};
use coderun_core::{AuthStore, SessionManager, ShutdownController};
use connection::handle_gateway;
use std::sync::Arc;

/// Maximum size of a single WS text message (1 MB).
const MAX_MESSAGE_BYTES: usize = 1_048_576;

/// WebSocket upgrade handler for `/ws/run`.
pub async fn gateway_handler(
    ws: WebSocketUpgrade,
    Extension(auth_store): Extension<Arc<AuthStore>>,
    Extension(sessions): Extension<Arc<SessionManager>>,
    Extension(shutdown): Extension<Arc<ShutdownController>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_gateway(socket, auth_store, sessions, shutdown))
}
