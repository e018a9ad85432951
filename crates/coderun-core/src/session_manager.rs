//! Session Manager
//!
//! Owns every live session, verifies ownership on each request and routes
//! requests to the session's coordinator task.
//!
//! **Security invariants**:
//! - All session access checks `owner == requester.user_id || Admin`
//! - `list_sessions()` only returns sessions owned by the requester

mod coordinator;

#[cfg(test)]
mod tests;

use crate::auth::{AuthContext, Scope};
use crate::error::{Error, Result};
use crate::event::SessionEvents;
use crate::session::{SessionSnapshot, SessionSummary};
use chrono::{DateTime, Utc};
use coderun_sandbox::{OutputChunk, ProcessRunner};
use coordinator::{Command, CoordinatorMsg, CoordinatorParams};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Session limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Live sessions (connections) allowed at once
    pub max_sessions: usize,
    /// Runs alive at once across all sessions
    pub max_concurrent_runs: usize,
    /// Bytes of output kept per session for late readers
    pub transcript_bytes: usize,
    /// Run requests allowed per session per minute (0 disables)
    pub runs_per_minute: u32,
    /// Largest accepted source payload
    pub max_source_bytes: usize,
    /// Longest accepted input line
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            max_concurrent_runs: 32,
            transcript_bytes: 64 * 1024,
            runs_per_minute: 30,
            max_source_bytes: 256 * 1024,
            max_line_bytes: 4096,
        }
    }
}

struct SessionEntry {
    owner: String,
    created_at: DateTime<Utc>,
    inbox: mpsc::UnboundedSender<CoordinatorMsg>,
    task: JoinHandle<()>,
}

impl SessionEntry {
    fn summary(&self, id: Uuid) -> SessionSummary {
        SessionSummary {
            id,
            owner: self.owner.clone(),
            created_at: self.created_at,
        }
    }
}

/// Session Manager
pub struct SessionManager {
    runner: ProcessRunner,
    config: SessionConfig,
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    run_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Create a session manager on top of a process runner
    pub fn new(runner: ProcessRunner, config: SessionConfig) -> Self {
        Self {
            run_slots: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            runner,
            config,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// The underlying process runner
    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Session limits
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a session owned by the requester and start its coordinator
    pub async fn create_session(
        &self,
        requester: &AuthContext,
    ) -> Result<(SessionSummary, SessionEvents)> {
        if self.shutdown.is_cancelled() {
            return Err(Error::InvalidState("server is shutting down".to_string()));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(Error::CapacityExceeded(format!(
                "session limit of {} reached",
                self.config.max_sessions
            )));
        }

        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbox, task) = coordinator::spawn(CoordinatorParams {
            session_id: id,
            runner: self.runner.clone(),
            events: events_tx,
            run_slots: Arc::clone(&self.run_slots),
            shutdown: self.shutdown.child_token(),
            transcript_bytes: self.config.transcript_bytes,
            runs_per_minute: self.config.runs_per_minute,
        });

        let entry = SessionEntry {
            owner: requester.user_id.clone(),
            created_at: Utc::now(),
            inbox,
            task,
        };
        let summary = entry.summary(id);
        sessions.insert(id, entry);
        info!(session_id = %id, user_id = %requester.user_id, "session created");
        Ok((summary, events_rx))
    }

    /// Replace the session's run with a new one built from `source`
    ///
    /// Returns the new run id once the previous run is gone and the build
    /// has been started; the outcome arrives as events.
    pub async fn on_run_request(
        &self,
        session_id: Uuid,
        requester: &AuthContext,
        source: String,
        language: Option<String>,
    ) -> Result<Uuid> {
        require(requester, Scope::RunExecute)?;
        if source.trim().is_empty() {
            return Err(Error::InvalidInput("source is empty".to_string()));
        }
        if source.len() > self.config.max_source_bytes {
            return Err(Error::InvalidInput(format!(
                "source exceeds {} bytes",
                self.config.max_source_bytes
            )));
        }
        self.runner.config().language(language.as_deref())?;

        let inbox = self.inbox_for(session_id, requester).await?;
        let run_id = Uuid::new_v4();
        let (reply, reply_rx) = oneshot::channel();
        send(
            &inbox,
            session_id,
            Command::Run {
                run_id,
                source,
                language,
                reply,
            },
        )?;
        reply_rx.await.map_err(|_| closed(session_id))??;
        Ok(run_id)
    }

    /// Deliver one line (a newline is appended) to the running program
    pub async fn on_input_line(
        &self,
        session_id: Uuid,
        requester: &AuthContext,
        line: &str,
    ) -> Result<()> {
        require(requester, Scope::RunExecute)?;
        let line = line
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(line);
        if line.len() > self.config.max_line_bytes {
            return Err(Error::InvalidInput(format!(
                "input line exceeds {} bytes",
                self.config.max_line_bytes
            )));
        }

        let inbox = self.inbox_for(session_id, requester).await?;
        send(
            &inbox,
            session_id,
            Command::Input {
                line: line.to_string(),
            },
        )
    }

    /// Terminate the running program, if any
    pub async fn on_cancel(&self, session_id: Uuid, requester: &AuthContext) -> Result<()> {
        require(requester, Scope::RunExecute)?;
        let inbox = self.inbox_for(session_id, requester).await?;
        send(&inbox, session_id, Command::Cancel)
    }

    /// Release the session; returns once its program is gone
    pub async fn on_disconnect(&self, session_id: Uuid) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or_else(|| not_found(session_id))?;

        let (done, done_rx) = oneshot::channel();
        if entry
            .inbox
            .send(CoordinatorMsg::Command(Command::Disconnect { done }))
            .is_ok()
        {
            let _ = done_rx.await;
        }
        if let Err(e) = entry.task.await {
            warn!(session_id = %session_id, error = %e, "coordinator task failed");
        }
        info!(session_id = %session_id, "session released");
        Ok(())
    }

    /// Current state of a session
    pub async fn session_status(
        &self,
        session_id: Uuid,
        requester: &AuthContext,
    ) -> Result<SessionSnapshot> {
        require(requester, Scope::SessionRead)?;
        let inbox = self.inbox_for(session_id, requester).await?;
        let (reply, rx) = oneshot::channel();
        send(&inbox, session_id, Command::Status { reply })?;
        rx.await.map_err(|_| closed(session_id))
    }

    /// Retained output of the current (or last) run
    pub async fn transcript(
        &self,
        session_id: Uuid,
        requester: &AuthContext,
    ) -> Result<Vec<OutputChunk>> {
        require(requester, Scope::SessionRead)?;
        let inbox = self.inbox_for(session_id, requester).await?;
        let (reply, rx) = oneshot::channel();
        send(&inbox, session_id, Command::Transcript { reply })?;
        rx.await.map_err(|_| closed(session_id))
    }

    /// Sessions owned by the requester; Admin sees all
    pub async fn list_sessions(&self, requester: &AuthContext) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, s)| requester.has_scope(&Scope::Admin) || s.owner == requester.user_id)
            .map(|(id, s)| s.summary(*id))
            .collect()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Runs currently holding a run slot (compiling or running)
    pub fn active_runs(&self) -> usize {
        self.config
            .max_concurrent_runs
            .saturating_sub(self.run_slots.available_permits())
    }

    /// Terminate every run and release every session
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let entries: Vec<(Uuid, SessionEntry)> = self.sessions.write().await.drain().collect();
        let count = entries.len();
        for (id, entry) in entries {
            if let Err(e) = entry.task.await {
                warn!(session_id = %id, error = %e, "coordinator task failed");
            }
        }
        info!(sessions = count, "all sessions released");
    }

    async fn inbox_for(
        &self,
        session_id: Uuid,
        requester: &AuthContext,
    ) -> Result<mpsc::UnboundedSender<CoordinatorMsg>> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(&session_id)
            .ok_or_else(|| not_found(session_id))?;
        if requester.has_scope(&Scope::Admin) || entry.owner == requester.user_id {
            Ok(entry.inbox.clone())
        } else {
            Err(Error::Unauthorized(
                "Not authorized to access this session".to_string(),
            ))
        }
    }
}

fn require(requester: &AuthContext, scope: Scope) -> Result<()> {
    requester
        .require_scope(&scope)
        .map_err(|e| Error::Unauthorized(e.to_string()))
}

fn send(
    inbox: &mpsc::UnboundedSender<CoordinatorMsg>,
    session_id: Uuid,
    cmd: Command,
) -> Result<()> {
    inbox
        .send(CoordinatorMsg::Command(cmd))
        .map_err(|_| closed(session_id))
}

fn not_found(session_id: Uuid) -> Error {
    Error::NotFound(format!("Session {} not found", session_id))
}

fn closed(session_id: Uuid) -> Error {
    Error::NotFound(format!("Session {} is closed", session_id))
}
