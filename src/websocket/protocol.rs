//! Run WebSocket wire protocol.
//!
//! Defines the frame format, method parameters and error types for the
//! `/ws/run` endpoint. Every message is a request, a response to a request,
//! or an unsolicited event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire frame: all messages on the WebSocket are one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum GatewayFrame {
    /// Client → Server: method invocation
    Request {
        /// Unique request ID (client-generated)
        id: String,
        /// Method name (e.g. "connect", "run")
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },
    /// Server → Client: response to a request
    Response {
        /// Matches the request ID
        id: String,
        /// Successful result (mutually exclusive with error)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error (mutually exclusive with result)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<GatewayError>,
    },
    /// Server → Client: unsolicited event
    Event {
        /// Event name
        event: String,
        /// Event payload
        data: Value,
    },
}

impl GatewayFrame {
    /// Create a success response for a given request ID.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self::Response {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response for a given request ID.
    pub fn err(id: impl Into<String>, error: GatewayError) -> Self {
        Self::Response {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Create an event frame.
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: name.into(),
            data,
        }
    }

    /// Serialize for the socket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Structured error in a Response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    /// Machine-readable error code
    pub code: GatewayErrorCode,
    /// Human-readable message
    pub message: String,
    /// Seconds until a rate-limited request may be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl GatewayError {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<coderun_core::Error> for GatewayError {
    fn from(err: coderun_core::Error) -> Self {
        use coderun_core::Error;
        use coderun_sandbox::Error as SandboxError;

        let code = match &err {
            Error::NotFound(_) => GatewayErrorCode::NotFound,
            Error::Unauthorized(_) => GatewayErrorCode::Forbidden,
            Error::InvalidState(_) => GatewayErrorCode::Unavailable,
            Error::RateLimited { .. } => GatewayErrorCode::RateLimited,
            Error::CapacityExceeded(_) => GatewayErrorCode::CapacityExceeded,
            Error::InvalidInput(_) => GatewayErrorCode::InvalidParams,
            Error::Sandbox(SandboxError::UnknownLanguage(_) | SandboxError::InvalidInput(_)) => {
                GatewayErrorCode::InvalidParams
            }
            Error::Sandbox(SandboxError::RuntimeUnavailable(_)) => GatewayErrorCode::Unavailable,
            Error::Sandbox(_) | Error::Internal(_) => GatewayErrorCode::InternalError,
        };
        let retry_after = match &err {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        Self {
            code,
            message: err.to_string(),
            retry_after,
        }
    }
}

/// Error codes for the run protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Authentication failed or missing
    Unauthorized,
    /// Insufficient scopes, or a session id that is not this connection's
    Forbidden,
    /// Must call "connect" first
    NotConnected,
    /// Unknown method
    UnknownMethod,
    /// Invalid parameters
    InvalidParams,
    /// Resource not found
    NotFound,
    /// Rate limit exceeded
    RateLimited,
    /// Session or run capacity reached
    CapacityExceeded,
    /// Server is shutting down or cannot execute programs
    Unavailable,
    /// Internal server error
    InternalError,
}

/// Parameters for the `connect` method.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// API key
    #[serde(default)]
    pub token: String,
    /// Client info
    #[serde(default)]
    pub client: ClientInfo,
    /// Protocol version requested
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Client metadata sent during connect.
#[derive(Debug, Default, Deserialize)]
pub struct ClientInfo {
    /// Client name (e.g. "coderun-web")
    #[serde(default)]
    pub name: String,
    /// Client version
    #[serde(default)]
    pub version: String,
}

/// Successful connect response data.
#[derive(Debug, Serialize)]
pub struct ConnectResult {
    /// Session bound to this connection
    pub session_id: Uuid,
    /// Scopes granted
    pub scopes: Vec<String>,
    /// Protocol version agreed upon
    pub protocol_version: u32,
    /// Language profiles accepted by `run`
    pub languages: Vec<String>,
    /// Profile used when `run` names none
    pub default_language: String,
}

/// Parameters for `run`.
#[derive(Debug, Deserialize)]
pub struct RunParams {
    pub session_id: Uuid,
    pub source: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Parameters for `input`.
#[derive(Debug, Deserialize)]
pub struct InputParams {
    pub session_id: Uuid,
    pub line: String,
}

/// Parameters for methods that only name the session.
#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub session_id: Uuid,
}
