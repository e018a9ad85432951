use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use coderun_core::{AuthContext, AuthStore, SessionEvents, SessionManager, ShutdownController};

use super::super::protocol::{
    ConnectParams, ConnectResult, GatewayError, GatewayErrorCode, GatewayFrame, PROTOCOL_VERSION,
};
use super::dispatch::{dispatch_method, DispatchContext};
use super::events::convert_event;

/// Max time without receiving a message before considering the connection dead.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 60;
/// How often to send server-side pings.
pub const PING_INTERVAL_SECS: u64 = 30;
/// How long the client has to send `connect`.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Main connection handler: handshake, then one session for the connection's lifetime.
pub async fn handle_gateway(
    socket: WebSocket,
    auth_store: Arc<AuthStore>,
    sessions: Arc<SessionManager>,
    shutdown: Arc<ShutdownController>,
) {
    let conn_id = Uuid::new_v4();
    if !shutdown.is_accepting_work() {
        debug!(conn_id = %conn_id, "Refusing connection during shutdown");
        let mut socket = socket;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    let guard = shutdown.register_task();
    info!(conn_id = %conn_id, "Run WS connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Phase 1: Wait for `connect` handshake (with timeout)
    let Some((auth, session_id, events)) =
        wait_for_connect(&mut ws_tx, &mut ws_rx, &auth_store, &sessions, conn_id).await
    else {
        info!(conn_id = %conn_id, "Run WS closed during handshake");
        return;
    };

    let span = tracing::info_span!("connection", conn_id = %conn_id, session_id = %session_id);
    async move {
        info!(user = %auth.user_id, "Run WS authenticated");

        // Phase 2: Authenticated message loop with event forwarding
        serve_session(
            &mut ws_tx,
            &mut ws_rx,
            &auth,
            session_id,
            events,
            &sessions,
        )
        .await;

        // Releasing the session terminates its run before the socket goes away
        if let Err(e) = sessions.on_disconnect(session_id).await {
            debug!(error = %e, "Session already released");
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        drop(guard);
        info!(user = %auth.user_id, "Run WS connection closed");
    }
    .instrument(span)
    .await;
}

async fn serve_session(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    auth: &AuthContext,
    session_id: Uuid,
    mut events: SessionEvents,
    sessions: &SessionManager,
) {
    let ping_interval = tokio::time::interval(tokio::time::Duration::from_secs(PING_INTERVAL_SECS));
    tokio::pin!(ping_interval);

    let mut last_recv = tokio::time::Instant::now();
    let heartbeat_timeout = tokio::time::Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);

    let ctx = DispatchContext {
        auth,
        session_id,
        sessions,
    };

    loop {
        tokio::select! {
            // Client message
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_recv = tokio::time::Instant::now();
                        if let Some(response) = handle_message(&text, &ctx).await {
                            if ws_tx.send(Message::Text(response.to_json())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_recv = tokio::time::Instant::now();
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_recv = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Run WS error");
                        break;
                    }
                    _ => {}
                }
            }
            // Session events → forward to client, in coordinator order
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let frame = convert_event(session_id, &event);
                        if ws_tx.send(Message::Text(frame.to_json())).await.is_err() {
                            break;
                        }
                    }
                    // Coordinator is gone; on server shutdown this follows its final run_ended
                    None => break,
                }
            }
            // Server ping (WS protocol level)
            _ = ping_interval.tick() => {
                if last_recv.elapsed() > heartbeat_timeout {
                    info!("Heartbeat timeout, closing");
                    break;
                }
                if ws_tx.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for the `connect` Request, authenticate and open the session.
async fn wait_for_connect(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    auth_store: &AuthStore,
    sessions: &SessionManager,
    conn_id: Uuid,
) -> Option<(AuthContext, Uuid, SessionEvents)> {
    let timeout = tokio::time::Duration::from_secs(CONNECT_TIMEOUT_SECS);

    let text = match tokio::time::timeout(timeout, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            reject(
                ws_tx,
                "",
                GatewayError::new(GatewayErrorCode::NotConnected, "Expected connect request"),
            )
            .await;
            return None;
        }
    };

    let frame: GatewayFrame = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(_) => {
            reject(
                ws_tx,
                "",
                GatewayError::new(GatewayErrorCode::InvalidParams, "Invalid frame format"),
            )
            .await;
            return None;
        }
    };

    let (request_id, params_value) = match frame {
        GatewayFrame::Request { id, method, params } if method == "connect" => (id, params),
        GatewayFrame::Request { id, method, .. } => {
            reject(
                ws_tx,
                id,
                GatewayError::new(
                    GatewayErrorCode::NotConnected,
                    format!("Must connect first, got method: {}", method),
                ),
            )
            .await;
            return None;
        }
        _ => {
            reject(
                ws_tx,
                "",
                GatewayError::new(GatewayErrorCode::NotConnected, "Expected connect Request"),
            )
            .await;
            return None;
        }
    };

    let connect_params: ConnectParams = match serde_json::from_value(params_value) {
        Ok(p) => p,
        Err(e) => {
            reject(
                ws_tx,
                request_id,
                GatewayError::new(
                    GatewayErrorCode::InvalidParams,
                    format!("Invalid connect params: {}", e),
                ),
            )
            .await;
            return None;
        }
    };

    let auth = match auth_store.validate_token(&connect_params.token) {
        Ok(auth) => auth,
        Err(e) => {
            debug!(conn_id = %conn_id, error = %e, "Connect rejected");
            reject(
                ws_tx,
                request_id,
                GatewayError::new(GatewayErrorCode::Unauthorized, "Invalid or expired token"),
            )
            .await;
            return None;
        }
    };

    let (summary, events) = match sessions.create_session(&auth).await {
        Ok(created) => created,
        Err(e) => {
            reject(ws_tx, request_id, GatewayError::from(e)).await;
            return None;
        }
    };

    let sandbox = sessions.runner().config();
    let mut languages: Vec<String> = sandbox.languages.keys().cloned().collect();
    languages.sort();
    let result = ConnectResult {
        session_id: summary.id,
        scopes: auth.scopes.iter().map(ToString::to_string).collect(),
        protocol_version: connect_params.protocol_version.min(PROTOCOL_VERSION),
        languages,
        default_language: sandbox.default_language.clone(),
    };
    let frame = match serde_json::to_value(result) {
        Ok(value) => GatewayFrame::ok(request_id, value),
        Err(e) => GatewayFrame::err(
            request_id,
            GatewayError::new(GatewayErrorCode::InternalError, e.to_string()),
        ),
    };
    if ws_tx.send(Message::Text(frame.to_json())).await.is_err() {
        let _ = sessions.on_disconnect(summary.id).await;
        return None;
    }

    debug!(
        conn_id = %conn_id,
        session_id = %summary.id,
        client = %connect_params.client.name,
        client_version = %connect_params.client.version,
        "Connect handshake complete"
    );

    Some((auth, summary.id, events))
}

async fn reject(ws_tx: &mut WsSink, id: impl Into<String>, error: GatewayError) {
    let frame = GatewayFrame::err(id, error);
    let _ = ws_tx.send(Message::Text(frame.to_json())).await;
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Handle an authenticated message. Returns a response frame if applicable.
pub(crate) async fn handle_message(text: &str, ctx: &DispatchContext<'_>) -> Option<GatewayFrame> {
    let frame: GatewayFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            return Some(GatewayFrame::err(
                "",
                GatewayError::new(
                    GatewayErrorCode::InvalidParams,
                    format!("Invalid frame: {}", e),
                ),
            ));
        }
    };

    match frame {
        GatewayFrame::Request { id, method, params } => {
            Some(dispatch_method(&id, &method, params, ctx).await)
        }
        _ => None,
    }
}
