//! Per-connection writer task and its byte-counting queue.
//!
//! The queue's buffered byte count (enqueued but not yet written to the
//! socket) is what backpressure decisions are made on.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{CloseReason, ServerMessage};

/// Item consumed by the writer task.
#[derive(Debug)]
pub enum Outgoing {
    Text(String),
    Close(CloseReason),
}

/// Cloneable handle for enqueueing frames to one socket.
///
/// Sending after the socket closed is a silent no-op.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Outgoing>,
    buffered: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl OutboundQueue {
    /// A queue with no writer attached; the caller owns the receiving end.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            buffered: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (queue, rx)
    }

    /// Bytes enqueued but not yet handed to the socket.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, message: &ServerMessage) {
        match message.to_text() {
            Ok(text) => self.send_text(text),
            Err(err) => tracing::error!(?err, "failed to serialize outbound frame"),
        }
    }

    pub fn send_text(&self, text: String) {
        if self.is_closed() {
            return;
        }
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(Outgoing::Text(text)).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
        }
    }

    /// Enqueue a close frame. Only the first close takes effect.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outgoing::Close(reason));
    }
}

/// Spawn the writer task draining a fresh queue into `sink`.
pub fn spawn_writer<S>(sink: S) -> (OutboundQueue, JoinHandle<()>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Debug,
{
    let (queue, rx) = OutboundQueue::detached();
    // The writer holds only the byte counter, so it exits once every queue
    // handle is dropped even if no close frame was ever enqueued.
    let handle = tokio::spawn(run_writer(sink, rx, Arc::clone(&queue.buffered)));
    (queue, handle)
}

async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    buffered: Arc<AtomicUsize>,
)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Debug,
{
    let mut broken = false;
    while let Some(item) = rx.recv().await {
        match item {
            Outgoing::Text(text) => {
                let len = text.len();
                if !broken {
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        tracing::debug!(?err, "ws write failed; discarding further frames");
                        broken = true;
                    }
                }
                buffered.fetch_sub(len, Ordering::AcqRel);
            }
            Outgoing::Close(reason) => {
                if !broken {
                    let frame = CloseFrame {
                        code: reason.code(),
                        reason: reason.reason().to_string().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}
