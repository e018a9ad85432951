//! Sessions API endpoints
//!
//! GET /api/v1/sessions     - List live sessions (owned by requester, all for admin)
//! GET /api/v1/sessions/:id - Point-in-time status of one session
//!
//! Sessions are created and driven over `/ws/run`; these routes only observe.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use coderun_core::{SessionManager, SessionSnapshot, SessionSummary};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::middleware::auth::RequireAuthStrict;

/// Response for the list endpoint
#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

/// Core error rendered as an HTTP response
pub struct ApiError(coderun_core::Error);

impl From<coderun_core::Error> for ApiError {
    fn from(e: coderun_core::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use coderun_core::Error;

        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn list_sessions(
    RequireAuthStrict(auth): RequireAuthStrict,
    Extension(sessions): Extension<Arc<SessionManager>>,
) -> Json<SessionList> {
    let list = sessions.list_sessions(&auth).await;
    Json(SessionList {
        total: list.len(),
        sessions: list,
    })
}

async fn session_status(
    RequireAuthStrict(auth): RequireAuthStrict,
    Extension(sessions): Extension<Arc<SessionManager>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(sessions.session_status(id, &auth).await?))
}

/// Create session routes
pub fn sessions_routes() -> Router {
    Router::new()
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/:id", get(session_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use coderun_core::{default_user_scopes, AuthContext, AuthStore, SessionConfig, ShutdownController};
    use coderun_sandbox::{ContainerRuntime, ProcessRunner, SandboxConfig};
    use secrecy::ExposeSecret;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        sessions: Arc<SessionManager>,
        alice_key: String,
    }

    fn fixture() -> Fixture {
        let auth_store = Arc::new(AuthStore::new(true));
        let (key, _) = auth_store
            .generate_api_key("alice", default_user_scopes(), "test")
            .unwrap();
        let runner = ProcessRunner::with_runtime(SandboxConfig::native(), ContainerRuntime::Native);
        let sessions = Arc::new(SessionManager::new(runner, SessionConfig::default()));
        let app = crate::server::build_router(&crate::server::AppState {
            auth_store,
            sessions: sessions.clone(),
            shutdown: ShutdownController::new(),
        });
        Fixture {
            app,
            sessions,
            alice_key: key.expose_secret().to_string(),
        }
    }

    fn get(uri: &str, key: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-API-Key", key)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_list_only_own_sessions() {
        let f = fixture();
        let (mine, _mine_events) = f
            .sessions
            .create_session(&AuthContext::user("alice"))
            .await
            .unwrap();
        let (_theirs, _their_events) = f
            .sessions
            .create_session(&AuthContext::user("bob"))
            .await
            .unwrap();

        let resp = f
            .app
            .oneshot(get("/api/v1/sessions", &f.alice_key))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["sessions"][0]["id"], mine.id.to_string());
    }

    #[tokio::test]
    async fn test_status_of_foreign_session_is_forbidden() {
        let f = fixture();
        let (theirs, _events) = f
            .sessions
            .create_session(&AuthContext::user("bob"))
            .await
            .unwrap();

        let uri = format!("/api/v1/sessions/{}", theirs.id);
        let resp = f.app.oneshot(get(&uri, &f.alice_key)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_status_of_own_session() {
        let f = fixture();
        let (mine, _events) = f
            .sessions
            .create_session(&AuthContext::user("alice"))
            .await
            .unwrap();

        let uri = format!("/api/v1/sessions/{}", mine.id);
        let resp = f.app.clone().oneshot(get(&uri, &f.alice_key)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["state"], "idle");

        let missing = format!("/api/v1/sessions/{}", Uuid::new_v4());
        let resp = f.app.oneshot(get(&missing, &f.alice_key)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
