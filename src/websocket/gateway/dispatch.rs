//! Method dispatch routing for the run WebSocket.

use coderun_core::{AuthContext, SessionManager};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::events::encode_chunk;
use crate::websocket::protocol::{
    GatewayError, GatewayErrorCode, GatewayFrame, InputParams, RunParams, SessionParams,
};

/// Per-connection context for method dispatch.
pub(crate) struct DispatchContext<'a> {
    pub auth: &'a AuthContext,
    /// Session bound to this connection at connect time
    pub session_id: Uuid,
    pub sessions: &'a SessionManager,
}

/// Route a method call to the appropriate handler.
pub(crate) async fn dispatch_method(
    id: &str,
    method: &str,
    params: serde_json::Value,
    ctx: &DispatchContext<'_>,
) -> GatewayFrame {
    let result = match method {
        "ping" => Ok(serde_json::json!({"pong": true})),
        "run" => run(params, ctx).await,
        "input" => input(params, ctx).await,
        "cancel" => cancel(params, ctx).await,
        "status" => status(params, ctx).await,
        "transcript" => transcript(params, ctx).await,
        "connect" => Err(GatewayError::new(
            GatewayErrorCode::InvalidParams,
            "Already connected",
        )),
        _ => Err(GatewayError::new(
            GatewayErrorCode::UnknownMethod,
            format!("Unknown method: {}", method),
        )),
    };

    match result {
        Ok(value) => GatewayFrame::ok(id, value),
        Err(error) => GatewayFrame::err(id, error),
    }
}

type MethodResult = Result<serde_json::Value, GatewayError>;

async fn run(params: serde_json::Value, ctx: &DispatchContext<'_>) -> MethodResult {
    let params: RunParams = parse_params(params)?;
    check_session(params.session_id, ctx)?;
    let run_id = ctx
        .sessions
        .on_run_request(ctx.session_id, ctx.auth, params.source, params.language)
        .await?;
    Ok(serde_json::json!({"run_id": run_id}))
}

async fn input(params: serde_json::Value, ctx: &DispatchContext<'_>) -> MethodResult {
    let params: InputParams = parse_params(params)?;
    check_session(params.session_id, ctx)?;
    ctx.sessions
        .on_input_line(ctx.session_id, ctx.auth, &params.line)
        .await?;
    Ok(serde_json::json!({"accepted": true}))
}

async fn cancel(params: serde_json::Value, ctx: &DispatchContext<'_>) -> MethodResult {
    let params: SessionParams = parse_params(params)?;
    check_session(params.session_id, ctx)?;
    ctx.sessions.on_cancel(ctx.session_id, ctx.auth).await?;
    Ok(serde_json::json!({"accepted": true}))
}

async fn status(params: serde_json::Value, ctx: &DispatchContext<'_>) -> MethodResult {
    let params: SessionParams = parse_params(params)?;
    check_session(params.session_id, ctx)?;
    let snapshot = ctx.sessions.session_status(ctx.session_id, ctx.auth).await?;
    serde_json::to_value(snapshot)
        .map_err(|e| GatewayError::new(GatewayErrorCode::InternalError, e.to_string()))
}

async fn transcript(params: serde_json::Value, ctx: &DispatchContext<'_>) -> MethodResult {
    let params: SessionParams = parse_params(params)?;
    check_session(params.session_id, ctx)?;
    let chunks = ctx.sessions.transcript(ctx.session_id, ctx.auth).await?;
    let chunks: Vec<serde_json::Value> = chunks.iter().map(encode_chunk).collect();
    Ok(serde_json::json!({
        "session_id": ctx.session_id,
        "chunks": chunks,
    }))
}

/// Requests may only address the session bound to their connection.
fn check_session(requested: Uuid, ctx: &DispatchContext<'_>) -> Result<(), GatewayError> {
    if requested == ctx.session_id {
        Ok(())
    } else {
        Err(GatewayError::new(
            GatewayErrorCode::Forbidden,
            "session_id does not belong to this connection",
        ))
    }
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, GatewayError> {
    serde_json::from_value(params).map_err(|e| {
        GatewayError::new(
            GatewayErrorCode::InvalidParams,
            format!("Invalid params: {}", e),
        )
    })
}
