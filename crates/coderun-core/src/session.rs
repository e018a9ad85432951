//! Session views and the output transcript

use chrono::{DateTime, Utc};
use coderun_sandbox::{OutputChunk, RunStatus};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

/// What a session is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No run
    Idle,
    /// Build step in progress
    Compiling,
    /// Program is live
    Running,
}

/// Summary view of a session (for list endpoints)
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session ID
    pub id: Uuid,
    /// Owner user ID
    pub owner: String,
    /// When the session was created
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of a session, produced by its coordinator
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session ID
    pub session_id: Uuid,
    /// Current state
    pub state: SessionState,
    /// Current run, if any
    pub run_id: Option<Uuid>,
    /// Language of the current run
    pub language: Option<String>,
    /// Output bytes forwarded by the current run
    pub output_bytes: usize,
    /// Lines queued while compiling
    pub pending_input: usize,
    /// Terminal status of the most recent finished run
    pub last_status: Option<RunStatus>,
    /// Runs requested over the session lifetime
    pub runs_started: u64,
    /// Last request or output
    pub last_activity: DateTime<Utc>,
}

/// Most recent output of the current run, bounded in bytes
///
/// Oldest chunks are evicted first; the newest chunk is always kept.
#[derive(Debug)]
pub(crate) struct Transcript {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    cap: usize,
}

impl Transcript {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    pub(crate) fn push(&mut self, chunk: OutputChunk) {
        if self.cap == 0 {
            return;
        }
        self.bytes += chunk.data.len();
        self.chunks.push_back(chunk);
        while self.bytes > self.cap && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.data.len();
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    pub(crate) fn snapshot(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }
}
