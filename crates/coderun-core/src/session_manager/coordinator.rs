//! Per-session coordinator
//!
//! One task per session owns the current run. Requests from the transport
//! and relay items from the run (start result, output chunks, completion)
//! arrive on the same inbox, so every state change happens on this task.
//! Relay items carry their run id and are dropped when that run is no
//! longer current. The start result stays in the start task's join handle,
//! so a program spawned just before its run was replaced is reaped by
//! whoever stops the run.

use crate::error::{Error, Result};
use crate::event::SessionEvent;
use crate::rate_limit::RateLimiter;
use crate::session::{SessionSnapshot, SessionState, Transcript};
use chrono::{DateTime, Utc};
use coderun_sandbox::{
    OutputChunk, ProcessRunner, RunHandle, RunStatus, StartRequest, INPUT_QUEUE_LINES,
};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Requests from the session manager
pub(crate) enum Command {
    Run {
        run_id: Uuid,
        source: String,
        language: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Input {
        line: String,
    },
    Cancel,
    Status {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Transcript {
        reply: oneshot::Sender<Vec<OutputChunk>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Items produced by a run's helper tasks
pub(crate) enum Relay {
    /// The start task finished; its result is in the task's join handle
    Started {
        run_id: Uuid,
    },
    Chunk {
        run_id: Uuid,
        chunk: OutputChunk,
    },
    Finished {
        run_id: Uuid,
        status: RunStatus,
    },
}

pub(crate) enum CoordinatorMsg {
    Command(Command),
    Relay(Relay),
}

pub(crate) struct CoordinatorParams {
    pub(crate) session_id: Uuid,
    pub(crate) runner: ProcessRunner,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) run_slots: Arc<Semaphore>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) transcript_bytes: usize,
    pub(crate) runs_per_minute: u32,
}

enum RunPhase {
    Compiling {
        task: JoinHandle<coderun_sandbox::Result<RunHandle>>,
        pending: VecDeque<String>,
    },
    Running {
        handle: Arc<RunHandle>,
    },
}

struct ActiveRun {
    run_id: Uuid,
    language: Option<String>,
    requested_at: Instant,
    cancel: CancellationToken,
    phase: RunPhase,
    _permit: OwnedSemaphorePermit,
}

/// How a stopped run ended
struct Stopped {
    run_id: Uuid,
    status: RunStatus,
    output_bytes: usize,
    duration_ms: u64,
}

struct Coordinator {
    session_id: Uuid,
    runner: ProcessRunner,
    inbox: mpsc::UnboundedReceiver<CoordinatorMsg>,
    relay_tx: mpsc::UnboundedSender<CoordinatorMsg>,
    events: mpsc::UnboundedSender<SessionEvent>,
    run_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    limiter: RateLimiter,
    transcript: Transcript,
    current: Option<ActiveRun>,
    last_status: Option<RunStatus>,
    runs_started: u64,
    last_activity: DateTime<Utc>,
}

/// Spawn the coordinator; returns its inbox and task handle
pub(crate) fn spawn(
    params: CoordinatorParams,
) -> (mpsc::UnboundedSender<CoordinatorMsg>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let span = info_span!("session", session_id = %params.session_id);
    let coordinator = Coordinator {
        session_id: params.session_id,
        runner: params.runner,
        inbox: rx,
        relay_tx: tx.clone(),
        events: params.events,
        run_slots: params.run_slots,
        shutdown: params.shutdown,
        limiter: RateLimiter::new(params.runs_per_minute),
        transcript: Transcript::new(params.transcript_bytes),
        current: None,
        last_status: None,
        runs_started: 0,
        last_activity: Utc::now(),
    };
    let task = tokio::spawn(coordinator.run().instrument(span));
    (tx, task)
}

impl Coordinator {
    async fn run(mut self) {
        debug!("coordinator started");
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    if let Some(stopped) = self.stop_current().await {
                        self.emit_ended(stopped);
                    }
                    break;
                }
                msg = self.inbox.recv() => msg,
            };

            match msg {
                Some(CoordinatorMsg::Command(Command::Disconnect { done })) => {
                    if let Some(stopped) = self.stop_current().await {
                        debug!(run_id = %stopped.run_id, "run stopped on disconnect");
                    }
                    let _ = done.send(());
                    break;
                }
                Some(CoordinatorMsg::Command(cmd)) => self.handle_command(cmd).await,
                Some(CoordinatorMsg::Relay(relay)) => self.handle_relay(relay).await,
                None => {
                    self.stop_current().await;
                    break;
                }
            }
        }
        debug!(session_id = %self.session_id, "coordinator exited");
    }

    fn emit(&self, event: SessionEvent) {
        // receiver gone means the transport closed; disconnect follows
        let _ = self.events.send(event);
    }

    fn emit_ended(&mut self, stopped: Stopped) {
        self.last_status = Some(stopped.status);
        self.emit(SessionEvent::RunEnded {
            run_id: stopped.run_id,
            status: stopped.status,
            output_bytes: stopped.output_bytes,
            duration_ms: stopped.duration_ms,
        });
    }

    fn current_id(&self) -> Option<Uuid> {
        self.current.as_ref().map(|run| run.run_id)
    }

    async fn handle_command(&mut self, cmd: Command) {
        self.last_activity = Utc::now();
        match cmd {
            Command::Run {
                run_id,
                source,
                language,
                reply,
            } => {
                let result = self.start_run(run_id, source, language).await;
                let _ = reply.send(result);
            }
            Command::Input { line } => self.write_input(line),
            Command::Cancel => match self.stop_current().await {
                Some(stopped) if stopped.status == RunStatus::Killed => {
                    info!(run_id = %stopped.run_id, "run cancelled");
                    self.last_status = Some(RunStatus::Killed);
                    self.emit(SessionEvent::RunCancelled {
                        run_id: stopped.run_id,
                    });
                }
                // finished on its own before the cancel landed
                Some(stopped) => self.emit_ended(stopped),
                None => self.emit(SessionEvent::NoActiveRun {
                    request: "cancel".to_string(),
                }),
            },
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Transcript { reply } => {
                let _ = reply.send(self.transcript.snapshot());
            }
            Command::Disconnect { .. } => {}
        }
    }

    async fn start_run(
        &mut self,
        run_id: Uuid,
        source: String,
        language: Option<String>,
    ) -> Result<()> {
        if let Err(retry_after) = self.limiter.check() {
            return Err(Error::RateLimited {
                retry_after: Some(retry_after),
            });
        }

        if let Some(stopped) = self.stop_current().await {
            info!(run_id = %stopped.run_id, "run replaced");
            self.emit_ended(stopped);
        }

        let permit = Arc::clone(&self.run_slots)
            .try_acquire_owned()
            .map_err(|_| Error::CapacityExceeded("too many concurrent runs".to_string()))?;

        self.transcript.clear();
        let cancel = self.shutdown.child_token();
        let mut request = StartRequest::new(source)
            .with_run_id(run_id)
            .with_cancel(cancel.clone());
        if let Some(language) = &language {
            request = request.with_language(language.clone());
        }

        let runner = self.runner.clone();
        let relay_tx = self.relay_tx.clone();
        let task = tokio::spawn(
            async move {
                let result = runner.start(request).await;
                let _ = relay_tx.send(CoordinatorMsg::Relay(Relay::Started { run_id }));
                result
            }
            .in_current_span(),
        );

        self.runs_started += 1;
        self.current = Some(ActiveRun {
            run_id,
            language,
            requested_at: Instant::now(),
            cancel,
            phase: RunPhase::Compiling {
                task,
                pending: VecDeque::new(),
            },
            _permit: permit,
        });
        debug!(run_id = %run_id, "run requested");
        Ok(())
    }

    fn write_input(&mut self, line: String) {
        use coderun_sandbox::Error as SandboxError;

        let Some(run) = self.current.as_mut() else {
            self.emit(SessionEvent::NoActiveRun {
                request: "input".to_string(),
            });
            return;
        };
        let run_id = run.run_id;
        let outcome = match &mut run.phase {
            // same bound as the program's stdin queue
            RunPhase::Compiling { pending, .. } if pending.len() >= INPUT_QUEUE_LINES => {
                Err(SandboxError::InputBacklog {
                    limit: INPUT_QUEUE_LINES,
                })
            }
            RunPhase::Compiling { pending, .. } => {
                pending.push_back(line);
                Ok(())
            }
            RunPhase::Running { handle } => handle.write_input(&line),
        };
        match outcome {
            Ok(()) => {}
            Err(err @ SandboxError::InputBacklog { .. }) => {
                debug!(run_id = %run_id, "input dropped, stdin backlog full");
                self.emit(SessionEvent::InputDropped {
                    run_id,
                    reason: err.to_string(),
                });
            }
            Err(_) => self.emit(SessionEvent::NoActiveRun {
                request: "input".to_string(),
            }),
        }
    }

    /// Terminate the current run and wait until it is gone
    async fn stop_current(&mut self) -> Option<Stopped> {
        let run = self.current.take()?;
        run.cancel.cancel();
        let duration_ms = run.requested_at.elapsed().as_millis() as u64;
        let (status, output_bytes) = match run.phase {
            RunPhase::Compiling { task, .. } => {
                match task.await {
                    // spawned before the cancel landed
                    Ok(Ok(handle)) => {
                        handle.terminate().await;
                    }
                    Ok(Err(_)) => {}
                    Err(e) => warn!(run_id = %run.run_id, error = %e, "start task failed"),
                }
                (RunStatus::Killed, 0)
            }
            RunPhase::Running { handle } => {
                let status = handle.terminate().await;
                (status, handle.output_bytes())
            }
        };
        Some(Stopped {
            run_id: run.run_id,
            status,
            output_bytes,
            duration_ms,
        })
    }

    async fn handle_relay(&mut self, relay: Relay) {
        match relay {
            Relay::Started { run_id } => self.on_started(run_id).await,
            Relay::Chunk { run_id, chunk } => {
                let live = matches!(
                    &self.current,
                    Some(ActiveRun { run_id: id, phase: RunPhase::Running { .. }, .. }) if *id == run_id
                );
                if !live {
                    trace!(run_id = %run_id, seq = chunk.seq, "dropping stale chunk");
                    return;
                }
                self.last_activity = Utc::now();
                self.transcript.push(chunk.clone());
                self.emit(SessionEvent::Output { run_id, chunk });
            }
            Relay::Finished { run_id, status } => {
                if self.current_id() != Some(run_id) {
                    trace!(run_id = %run_id, "dropping stale completion");
                    return;
                }
                let Some(run) = self.current.take() else {
                    return;
                };
                let output_bytes = match &run.phase {
                    RunPhase::Running { handle } => handle.output_bytes(),
                    RunPhase::Compiling { .. } => 0,
                };
                self.emit_ended(Stopped {
                    run_id,
                    status,
                    output_bytes,
                    duration_ms: run.requested_at.elapsed().as_millis() as u64,
                });
            }
        }
    }

    async fn on_started(&mut self, run_id: Uuid) {
        // a superseded run was already reaped by stop_current
        if self.current_id() != Some(run_id) {
            trace!(run_id = %run_id, "dropping stale start");
            return;
        }
        let Some(RunPhase::Compiling { task, .. }) = self.current.as_mut().map(|run| &mut run.phase)
        else {
            return;
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(coderun_sandbox::Error::Spawn(format!("start task failed: {e}"))),
        };

        let mut handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                self.current = None;
                self.fail_start(run_id, err);
                return;
            }
        };

        let stream = handle.take_output();
        let handle = Arc::new(handle);
        let language = handle.language().to_string();

        let Some(run) = self.current.as_mut() else {
            return;
        };
        let pending = match &mut run.phase {
            RunPhase::Compiling { pending, .. } => std::mem::take(pending),
            RunPhase::Running { .. } => VecDeque::new(),
        };
        run.language = Some(language.clone());
        run.phase = RunPhase::Running {
            handle: Arc::clone(&handle),
        };

        info!(run_id = %run_id, pid = ?handle.pid(), "run started");
        self.emit(SessionEvent::RunStarted { run_id, language });

        for line in pending {
            if handle.write_input(&line).is_err() {
                break;
            }
        }

        let relay_tx = self.relay_tx.clone();
        tokio::spawn(
            async move {
                if let Some(mut stream) = stream {
                    while let Some(chunk) = stream.next().await {
                        let item = CoordinatorMsg::Relay(Relay::Chunk { run_id, chunk });
                        if relay_tx.send(item).is_err() {
                            break;
                        }
                    }
                }
                let status = handle.wait().await;
                let _ = relay_tx.send(CoordinatorMsg::Relay(Relay::Finished { run_id, status }));
            }
            .in_current_span(),
        );
    }

    fn fail_start(&mut self, run_id: Uuid, err: coderun_sandbox::Error) {
        use coderun_sandbox::Error as SandboxError;

        let (diagnostics, exit_code) = match err {
            // cancelled by stop_current, which already reported the run
            SandboxError::Cancelled => return,
            SandboxError::Compile {
                diagnostics,
                exit_code,
            } => (diagnostics, exit_code),
            SandboxError::Timeout(ms) => (format!("compilation timed out after {ms}ms"), None),
            other => {
                warn!(run_id = %run_id, error = %other, "run could not be started");
                (other.to_string(), None)
            }
        };
        self.last_status = Some(RunStatus::CompileFailed);
        self.emit(SessionEvent::CompileError {
            run_id,
            diagnostics,
            exit_code,
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        let (state, run_id, language, output_bytes, pending_input) = match &self.current {
            None => (SessionState::Idle, None, None, 0, 0),
            Some(run) => match &run.phase {
                RunPhase::Compiling { pending, .. } => (
                    SessionState::Compiling,
                    Some(run.run_id),
                    run.language.clone(),
                    0,
                    pending.len(),
                ),
                RunPhase::Running { handle } => (
                    SessionState::Running,
                    Some(run.run_id),
                    run.language.clone(),
                    handle.output_bytes(),
                    0,
                ),
            },
        };
        SessionSnapshot {
            session_id: self.session_id,
            state,
            run_id,
            language,
            output_bytes,
            pending_input,
            last_status: self.last_status,
            runs_started: self.runs_started,
            last_activity: self.last_activity,
        }
    }
}
