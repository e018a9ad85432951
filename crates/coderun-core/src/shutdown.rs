//! Graceful shutdown
//!
//! ```ignore
//! let shutdown = ShutdownController::new();
//! let guard = shutdown.register_task();
//! tokio::spawn(async move { serve_connection(guard).await });
//! shutdown.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Shutdown phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// No new connections or runs accepted
    Stopping,
    /// Waiting for connections to close
    Draining,
    /// Drain timed out
    Terminating,
    /// Shutdown complete
    Terminated,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Draining => write!(f, "Draining"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Coordinates shutdown of connections and sessions
#[derive(Debug)]
pub struct ShutdownController {
    cancel_token: CancellationToken,
    phase: AtomicU32,
    shutdown_initiated: AtomicBool,
    active_tasks: Arc<AtomicU32>,
    timeout: Duration,
}

impl ShutdownController {
    /// Controller with the default drain timeout
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS))
    }

    /// Controller with a custom drain timeout
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            cancel_token: CancellationToken::new(),
            phase: AtomicU32::new(ShutdownPhase::Running as u32),
            shutdown_initiated: AtomicBool::new(false),
            active_tasks: Arc::new(AtomicU32::new(0)),
            timeout,
        })
    }

    /// Child token cancelled when shutdown begins
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        match self.phase.load(Ordering::SeqCst) {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Stopping,
            2 => ShutdownPhase::Draining,
            3 => ShutdownPhase::Terminating,
            _ => ShutdownPhase::Terminated,
        }
    }

    /// Check if shutdown has been initiated
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Check if still accepting new work
    #[must_use]
    pub fn is_accepting_work(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }

    /// Track a task (a client connection); released when the guard drops
    pub fn register_task(&self) -> TaskGuard {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            counter: Arc::clone(&self.active_tasks),
            token: self.token(),
        }
    }

    /// Number of live task guards
    #[must_use]
    pub fn active_task_count(&self) -> u32 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u32, Ordering::SeqCst);
        info!(phase = %phase, "Shutdown phase changed");
    }

    /// Refuse new work without cancelling what is already running
    ///
    /// Called as soon as a shutdown signal arrives so that connections
    /// opened while the server drains are turned away; [`Self::shutdown`]
    /// still runs the full sequence afterwards.
    pub fn stop_accepting(&self) {
        if self
            .phase
            .compare_exchange(
                ShutdownPhase::Running as u32,
                ShutdownPhase::Stopping as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!(phase = %ShutdownPhase::Stopping, "Shutdown phase changed");
        }
    }

    /// Stop accepting work, cancel tasks and wait for them to drain
    pub async fn shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already initiated");
            return;
        }

        info!("Initiating graceful shutdown...");
        self.set_phase(ShutdownPhase::Stopping);
        self.set_phase(ShutdownPhase::Draining);
        self.cancel_token.cancel();

        let drain_start = std::time::Instant::now();
        loop {
            let active = self.active_task_count();
            if active == 0 {
                info!("All connections closed");
                break;
            }
            if drain_start.elapsed() >= self.timeout {
                warn!(
                    active_tasks = active,
                    timeout_secs = self.timeout.as_secs(),
                    "Shutdown timeout exceeded, force terminating"
                );
                self.set_phase(ShutdownPhase::Terminating);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.set_phase(ShutdownPhase::Terminated);
        info!("Graceful shutdown complete");
    }
}

/// Active task marker, movable into spawned tasks
#[derive(Debug)]
pub struct TaskGuard {
    counter: Arc<AtomicU32>,
    token: CancellationToken,
}

impl TaskGuard {
    /// Token cancelled when shutdown begins
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Check if shutdown was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_phases() {
        let controller = ShutdownController::new();
        assert_eq!(controller.phase(), ShutdownPhase::Running);
        assert!(controller.is_accepting_work());

        controller.shutdown().await;

        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
        assert!(!controller.is_accepting_work());
        assert!(controller.is_shutting_down());
    }

    #[tokio::test]
    async fn test_task_guard_moves_into_task() {
        let controller = ShutdownController::new();
        let guard = controller.register_task();
        assert_eq!(controller.active_task_count(), 1);

        let token = guard.token();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            drop(guard);
        });

        controller.shutdown().await;
        task.await.unwrap();
        assert_eq!(controller.active_task_count(), 0);
        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let controller = ShutdownController::with_timeout(Duration::from_millis(200));
        let _stuck = controller.register_task();

        controller.shutdown().await;
        assert_eq!(controller.active_task_count(), 1);
        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    }

    #[tokio::test]
    async fn test_double_shutdown_is_noop() {
        let controller = ShutdownController::new();
        controller.shutdown().await;
        controller.shutdown().await;
        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    }

    #[tokio::test]
    async fn test_stop_accepting_keeps_tasks_running() {
        let controller = ShutdownController::new();
        let guard = controller.register_task();
        let token = guard.token();

        controller.stop_accepting();
        assert!(!controller.is_accepting_work());
        assert_eq!(controller.phase(), ShutdownPhase::Stopping);
        assert!(!token.is_cancelled());
        assert!(!controller.is_shutting_down());

        drop(guard);
        controller.shutdown().await;
        assert!(token.is_cancelled());
        assert_eq!(controller.phase(), ShutdownPhase::Terminated);

        // never moves a finished controller backwards
        controller.stop_accepting();
        assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    }
}
