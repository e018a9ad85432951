//! Server initialization
//!
//! Contains the main `run()` function that starts all server components.

use super::config::AppConfig;
use super::loader::load_config;
use super::validation::validate_production_config;
use anyhow::{Context, Result};
use axum::{routing::get, Extension, Router};
use coderun_core::{
    admin_scopes, default_user_scopes, wait_for_shutdown_signal, AuthStore, SessionManager,
    ShutdownController,
};
use coderun_sandbox::ProcessRunner;
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Shared server components, injected into handlers as extensions
#[derive(Clone)]
pub struct AppState {
    pub auth_store: Arc<AuthStore>,
    pub sessions: Arc<SessionManager>,
    pub shutdown: Arc<ShutdownController>,
}

/// Build the main router with all endpoints
pub fn build_router(state: &AppState) -> Router {
    Router::new()
        // Health endpoints (/health public for LB, /health/detailed requires auth)
        .merge(crate::api::health_routes())
        // Read-only session views (owner or admin)
        .merge(crate::api::sessions_routes())
        // WebSocket routes
        .merge(crate::websocket::websocket_router())
        .route("/", get(|| async { "coderun" }))
        // Layers (applied to all routes)
        .layer(Extension(state.auth_store.clone()))
        .layer(Extension(state.sessions.clone()))
        .layer(Extension(state.shutdown.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create the auth store and register configured keys
pub fn init_auth(config: &AppConfig) -> Arc<AuthStore> {
    let auth_enabled = config.server.auth.enabled;
    let auth_store = Arc::new(AuthStore::new(auth_enabled));

    for entry in &config.server.auth.api_keys {
        let scopes = if entry.admin {
            admin_scopes()
        } else {
            default_user_scopes()
        };
        let label = if entry.label.is_empty() {
            entry.user.as_str()
        } else {
            entry.label.as_str()
        };
        if let Err(e) = auth_store.register_key_hash(&entry.hash, &entry.user, scopes, label) {
            warn!(user = %entry.user, error = %e, "Skipping configured API key");
        }
    }

    if auth_enabled && config.server.auth.auto_generate_key && auth_store.active_key_count() == 0 {
        // Auto-generate admin API key on first run
        match auth_store.generate_api_key("admin", admin_scopes(), "auto-generated admin key") {
            Ok((key, _hash)) => {
                info!("==========================================================");
                info!("  AUTO-GENERATED ADMIN API KEY (save this, shown once!):");
                info!("  {}", key.expose_secret());
                info!("==========================================================");
            }
            Err(e) => {
                warn!("Failed to auto-generate API key: {}", e);
            }
        }
    }

    if auth_enabled {
        info!(
            keys = auth_store.active_key_count(),
            "Authentication ENABLED - API key required to connect"
        );
    } else {
        warn!("SECURITY: Authentication disabled - anyone who can reach the server can execute code (development only). Enable [server.auth] enabled = true for production.");
    }

    auth_store
}

/// Resolves with `signal`, after new connections start being refused
async fn refuse_work_on<F>(signal: F, controller: Arc<ShutdownController>)
where
    F: std::future::Future<Output = ()>,
{
    signal.await;
    controller.stop_accepting();
}

/// Run the server
pub async fn run() -> Result<()> {
    info!("Starting coderun v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!("Configuration loaded");
    validate_production_config(&config)?;

    let sandbox_config = config.sandbox_config();
    let runner = ProcessRunner::new(sandbox_config)
        .await
        .context("Failed to initialize process runner")?;
    info!(
        runtime = %runner.runtime(),
        isolated = runner.runtime().is_isolated(),
        "Process runner initialized"
    );
    if !runner.runtime().is_isolated() {
        warn!("SECURITY: Programs run directly on the host (allow_unsandboxed = true)");
    }

    let sessions = Arc::new(SessionManager::new(runner, config.session_config()));
    info!(
        max_sessions = config.sessions.max_sessions,
        max_concurrent_runs = config.sessions.max_concurrent_runs,
        "Session manager initialized"
    );

    let shutdown_controller = ShutdownController::new();
    info!("Shutdown controller initialized (timeout: 30s)");

    let state = AppState {
        auth_store: init_auth(&config),
        sessions: Arc::clone(&sessions),
        shutdown: Arc::clone(&shutdown_controller),
    };
    let app = build_router(&state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);
    info!("Run WebSocket at ws://{}/ws/run", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(refuse_work_on(
            wait_for_shutdown_signal(),
            Arc::clone(&shutdown_controller),
        ))
        .await
        .context("HTTP server error")?;

    // Ending every session emits a final run_ended and closes its connection
    info!("Terminating live runs...");
    sessions.shutdown_all().await;
    shutdown_controller.shutdown().await;

    info!("coderun shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_stops_accepting_before_drain() {
        let controller = ShutdownController::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(refuse_work_on(
            async move {
                let _ = rx.await;
            },
            Arc::clone(&controller),
        ));

        tokio::task::yield_now().await;
        assert!(controller.is_accepting_work());

        tx.send(()).unwrap();
        waiter.await.unwrap();
        assert!(!controller.is_accepting_work());
        assert!(!controller.is_shutting_down());
    }
}
