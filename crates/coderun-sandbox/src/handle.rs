//! Handle to a live run and the tasks that supervise it

use crate::error::{Error, Result};
use crate::output::{OutputBudget, OutputChunk, OutputStream, StreamKind};
use crate::process::KillTarget;
use crate::status::RunStatus;
use crate::workspace::Workspace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_BUF_SIZE: usize = 8 * 1024;
const RAW_CHANNEL_CAPACITY: usize = 64;
/// How long pipe readers may keep draining after the process is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for the kernel to reap a SIGKILLed child
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Lines that may wait for a program that is not reading its stdin
pub const INPUT_QUEUE_LINES: usize = 256;

/// Handle to a spawned program
///
/// Dropping the handle does not stop the program; call [`RunHandle::terminate`].
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    language: String,
    pid: Option<u32>,
    started_at: Instant,
    input_tx: mpsc::Sender<Vec<u8>>,
    input_closed: CancellationToken,
    output: Option<OutputStream>,
    status: watch::Receiver<RunStatus>,
    cancel: CancellationToken,
    output_bytes: Arc<AtomicUsize>,
}

impl RunHandle {
    /// Run id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Language profile name
    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    /// OS pid of the spawned child (the container CLI for isolated runs)
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Time since the program was spawned
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Output bytes forwarded so far (final once the run has ended)
    #[must_use]
    pub fn output_bytes(&self) -> usize {
        self.output_bytes.load(Ordering::Relaxed)
    }

    /// Queue `line` plus a newline for the program's stdin
    ///
    /// Returns [`Error::InputBacklog`] when [`INPUT_QUEUE_LINES`] lines are
    /// already waiting for the program to read them.
    pub fn write_input(&self, line: &str) -> Result<()> {
        if self.status().is_terminal() || self.input_closed.is_cancelled() {
            return Err(Error::ProcessGone);
        }
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.input_tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::InputBacklog {
                limit: INPUT_QUEUE_LINES,
            },
            mpsc::error::TrySendError::Closed(_) => Error::ProcessGone,
        })
    }

    /// Close the program's stdin after queued input has been written
    pub fn close_input(&self) -> Result<()> {
        if self.input_tx.is_closed() {
            return Err(Error::ProcessGone);
        }
        self.input_closed.cancel();
        Ok(())
    }

    /// Take the output stream; `None` if it was already taken
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// Kill the program and its descendants and wait for cleanup
    ///
    /// Idempotent. Returns the terminal status, which is the program's own
    /// exit status if it had already finished.
    pub async fn terminate(&self) -> RunStatus {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for a terminal status
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status.clone();
        let result = rx.wait_for(RunStatus::is_terminal).await.map(|s| *s);
        match result {
            Ok(status) => status,
            Err(_) => *rx.borrow(),
        }
    }
}

/// Pieces of a freshly spawned child handed to [`supervise`]
pub(crate) struct Spawned {
    pub(crate) id: Uuid,
    pub(crate) language: String,
    pub(crate) child: Child,
    pub(crate) kill: KillTarget,
    pub(crate) workspace: Workspace,
    pub(crate) timeout: Duration,
    pub(crate) max_output_bytes: usize,
    pub(crate) cancel: CancellationToken,
    pub(crate) live: Arc<AtomicUsize>,
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wire up stdin writer, pipe readers and the supervisor for a child
pub(crate) fn supervise(mut spawned: Spawned) -> Result<RunHandle> {
    let stdin = spawned.child.stdin.take();
    let stdout = spawned
        .child
        .stdout
        .take()
        .ok_or_else(|| Error::Spawn("stdout not captured".to_string()))?;
    let stderr = spawned
        .child
        .stderr
        .take()
        .ok_or_else(|| Error::Spawn("stderr not captured".to_string()))?;

    let pid = spawned.child.id();
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_LINES);
    let input_closed = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(RunStatus::Running);
    let output_bytes = Arc::new(AtomicUsize::new(0));
    let finished = CancellationToken::new();

    if let Some(stdin) = stdin {
        tokio::spawn(write_stdin(
            stdin,
            input_rx,
            input_closed.clone(),
            finished.clone(),
            spawned.id,
        ));
    }

    let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
    let readers = [
        tokio::spawn(read_pipe(stdout, StreamKind::Stdout, raw_tx.clone())),
        tokio::spawn(read_pipe(stderr, StreamKind::Stderr, raw_tx)),
    ];

    let handle = RunHandle {
        id: spawned.id,
        language: spawned.language.clone(),
        pid,
        started_at: Instant::now(),
        input_tx,
        input_closed,
        output: Some(OutputStream::new(out_rx)),
        status: status_rx,
        cancel: spawned.cancel.clone(),
        output_bytes: Arc::clone(&output_bytes),
    };

    let guard = LiveGuard::new(Arc::clone(&spawned.live));
    tokio::spawn(async move {
        let run_id = spawned.id;
        let status = run_supervisor(spawned, raw_rx, out_tx, &output_bytes, readers).await;
        finished.cancel();
        drop(guard);
        info!(
            run_id = %run_id,
            status = %status,
            exit_code = ?status.exit_code(),
            output_bytes = output_bytes.load(Ordering::Relaxed),
            "run finished"
        );
        let _ = status_tx.send(status);
    });

    Ok(handle)
}

async fn run_supervisor(
    spawned: Spawned,
    mut raw_rx: mpsc::Receiver<(StreamKind, Vec<u8>)>,
    out_tx: mpsc::UnboundedSender<OutputChunk>,
    output_bytes: &AtomicUsize,
    readers: [tokio::task::JoinHandle<()>; 2],
) -> RunStatus {
    let Spawned {
        id,
        mut child,
        kill,
        workspace,
        timeout,
        max_output_bytes,
        cancel,
        ..
    } = spawned;

    let mut budget = OutputBudget::new(max_output_bytes);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut readers_open = true;

    let forward = |budget: &mut OutputBudget, kind, data| {
        for chunk in budget.admit(kind, data) {
            let _ = out_tx.send(chunk);
        }
        output_bytes.store(budget.forwarded(), Ordering::Relaxed);
    };

    let (status, reaped) = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break (RunStatus::Killed, false),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(run_id = %id, timeout_ms = timeout.as_millis() as u64, "run timed out");
                break (RunStatus::TimedOut, false);
            }
            exit = child.wait() => {
                let status = match exit {
                    Ok(exit) => RunStatus::from_exit(exit),
                    Err(e) => {
                        warn!(run_id = %id, error = %e, "wait on child failed");
                        RunStatus::Exited { code: -1 }
                    }
                };
                break (status, true);
            }
            raw = raw_rx.recv(), if readers_open => match raw {
                Some((kind, data)) => forward(&mut budget, kind, data),
                None => readers_open = false,
            },
        }
    };

    // descendants may still hold the pipes open after the child exits
    kill.kill().await;
    if !reaped && tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        warn!(run_id = %id, "child not reaped after SIGKILL");
        let _ = child.start_kill();
    }

    let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    while readers_open {
        match tokio::time::timeout_at(drain_deadline, raw_rx.recv()).await {
            Ok(Some((kind, data))) => forward(&mut budget, kind, data),
            Ok(None) => readers_open = false,
            Err(_) => {
                debug!(run_id = %id, "drain grace elapsed");
                break;
            }
        }
    }
    for reader in readers {
        reader.abort();
    }

    drop(out_tx);
    drop(workspace);
    status
}

async fn read_pipe<R>(mut pipe: R, kind: StreamKind, tx: mpsc::Sender<(StreamKind, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((kind, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(stream = ?kind, error = %e, "pipe read failed");
                break;
            }
        }
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
    finished: CancellationToken,
    run_id: Uuid,
) {
    loop {
        // queued lines go out before a close takes effect
        let msg = tokio::select! {
            biased;
            _ = finished.cancelled() => break,
            msg = rx.recv() => msg,
            _ = closed.cancelled() => break,
        };
        match msg {
            Some(bytes) => {
                let written = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                };
                if let Err(e) = written.await {
                    debug!(run_id = %run_id, error = %e, "stdin closed");
                    break;
                }
            }
            None => break,
        }
    }
}
