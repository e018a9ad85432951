//! Ordered output of a run

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Source of an output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Program stdout
    Stdout,
    /// Program stderr
    Stderr,
    /// Runner notices (truncation marker)
    System,
}

/// One piece of output, sequenced at the merge point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Strictly increasing within a run, starting at 0
    pub seq: u64,
    /// Which stream produced the bytes
    pub stream: StreamKind,
    /// Raw bytes, not necessarily valid UTF-8
    pub data: Vec<u8>,
    /// Set on the single marker emitted when the output cap is reached
    #[serde(default)]
    pub truncated: bool,
}

/// Stream of output chunks; ends when the process exits
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<OutputChunk>,
}

impl OutputStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<OutputChunk>) -> Self {
        Self { rx }
    }

    /// Receive the next chunk, `None` once the run has finished
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }
}

impl Stream for OutputStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Sequencing and output cap applied at the merge point
#[derive(Debug)]
pub(crate) struct OutputBudget {
    next_seq: u64,
    forwarded: usize,
    cap: usize,
    truncated: bool,
}

impl OutputBudget {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            next_seq: 0,
            forwarded: 0,
            cap,
            truncated: false,
        }
    }

    /// Bytes forwarded so far
    pub(crate) fn forwarded(&self) -> usize {
        self.forwarded
    }

    /// Admit raw bytes, producing at most one data chunk and one marker
    pub(crate) fn admit(&mut self, stream: StreamKind, mut data: Vec<u8>) -> Vec<OutputChunk> {
        if self.truncated || data.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(2);
        let room = self.cap - self.forwarded;
        let overflow = data.len() > room;
        if overflow {
            data.truncate(room);
        }

        if !data.is_empty() {
            self.forwarded += data.len();
            out.push(self.chunk(stream, data, false));
        }

        if overflow {
            self.truncated = true;
            let notice = format!("\n[output truncated after {} bytes]\n", self.cap);
            out.push(self.chunk(StreamKind::System, notice.into_bytes(), true));
        }

        out
    }

    fn chunk(&mut self, stream: StreamKind, data: Vec<u8>, truncated: bool) -> OutputChunk {
        let seq = self.next_seq;
        self.next_seq += 1;
        OutputChunk {
            seq,
            stream,
            data,
            truncated,
        }
    }
}
