//! Health check endpoints with component-level diagnostics.
//!
//! Provides:
//! - `/health`: simple "healthy" + version (for load balancers)
//! - `/health/detailed`: runner, session and shutdown status

use axum::extract::Extension;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use coderun_core::{SessionManager, ShutdownController};
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::auth::RequireAuthStrict;

/// Simple health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed health response with per-component checks
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: HealthChecks,
}

/// All component health checks
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub runner: ComponentHealth,
    pub sessions: ComponentHealth,
    pub shutdown: ComponentHealth,
}

/// Individual component health status
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    fn healthy_with_details(details: serde_json::Value) -> Self {
        Self {
            status: "healthy",
            details: Some(details),
        }
    }

    fn degraded(details: serde_json::Value) -> Self {
        Self {
            status: "degraded",
            details: Some(details),
        }
    }
}

/// Simple health check (for load balancers)
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Detailed health check (requires strict authentication, never bypassed)
async fn detailed_health_check(
    RequireAuthStrict(_auth): RequireAuthStrict,
    Extension(sessions): Extension<Arc<SessionManager>>,
    Extension(shutdown): Extension<Arc<ShutdownController>>,
) -> Json<DetailedHealthResponse> {
    let runner = check_runner(&sessions);
    let session_health = check_sessions(&sessions).await;
    let shutdown_health = check_shutdown(&shutdown);

    let overall_status = overall([runner.status, session_health.status, shutdown_health.status]);

    Json(DetailedHealthResponse {
        status: overall_status,
        version: env!("CARGO_PKG_VERSION"),
        checks: HealthChecks {
            runner,
            sessions: session_health,
            shutdown: shutdown_health,
        },
    })
}

fn overall(statuses: [&'static str; 3]) -> &'static str {
    if statuses.iter().all(|s| *s == "healthy") {
        "healthy"
    } else {
        "degraded"
    }
}

/// Runtime in use and live programs
fn check_runner(sessions: &SessionManager) -> ComponentHealth {
    let runner = sessions.runner();
    let runtime = runner.runtime();
    let details = serde_json::json!({
        "runtime": runtime.display_name(),
        "isolated": runtime.is_isolated(),
        "live_processes": runner.live_processes(),
    });
    if runtime.is_isolated() {
        ComponentHealth::healthy_with_details(details)
    } else {
        ComponentHealth::degraded(details)
    }
}

/// Session and run counts against their limits
async fn check_sessions(sessions: &SessionManager) -> ComponentHealth {
    let config = sessions.config();
    let count = sessions.session_count().await;
    let active_runs = sessions.active_runs();
    let details = serde_json::json!({
        "sessions": count,
        "max_sessions": config.max_sessions,
        "active_runs": active_runs,
        "max_concurrent_runs": config.max_concurrent_runs,
    });
    if count >= config.max_sessions || active_runs >= config.max_concurrent_runs {
        ComponentHealth::degraded(details)
    } else {
        ComponentHealth::healthy_with_details(details)
    }
}

fn check_shutdown(shutdown: &ShutdownController) -> ComponentHealth {
    let details = serde_json::json!({
        "phase": shutdown.phase().to_string(),
        "connections": shutdown.active_task_count(),
    });
    if shutdown.is_accepting_work() {
        ComponentHealth::healthy_with_details(details)
    } else {
        ComponentHealth::degraded(details)
    }
}

/// Create health routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/detailed", get(detailed_health_check))
}
