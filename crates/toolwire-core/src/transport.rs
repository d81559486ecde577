//! Transport contract shared by every connection kind.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the inbound event channel between a transport and its reader.
pub const INBOUND_CAPACITY: usize = 1024;

/// Transport error.
///
/// Every variant is terminal for the connection attempt it occurred on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Transport not connected")]
    NotConnected,
    #[error("Transport closed")]
    Closed,
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Unexpected close: {0}")]
    UnexpectedClose(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Connection kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process, newline-delimited JSON over stdio.
    Pipe,
    /// HTTP request/response plus a server-sent event stream.
    Http,
    /// Full-duplex WebSocket.
    Socket,
    /// In-process channel pair.
    Channel,
}

/// Event pushed from a transport to whoever consumes its inbound side.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete frame.
    Frame(Bytes),
    /// Terminal event. `None` means an orderly close.
    Closed(Option<TransportError>),
}

/// Receiving half of a transport's inbound events.
pub type InboundEvents = mpsc::Receiver<TransportEvent>;

/// Sending half of a transport's inbound events.
///
/// Guarantees that at most one terminal event is emitted and that no frame
/// follows it.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TransportEvent>,
    terminated: Arc<AtomicBool>,
}

impl EventSink {
    /// Create a sink and its receiver.
    #[must_use]
    pub fn channel() -> (Self, InboundEvents) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        (
            Self {
                tx,
                terminated: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Push a frame. Returns `false` once the sink is terminated or the
    /// receiver is gone.
    pub async fn frame(&self, frame: Bytes) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.tx.send(TransportEvent::Frame(frame)).await.is_ok()
    }

    /// Emit the terminal event. Later calls are no-ops.
    pub async fn terminate(&self, error: Option<TransportError>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ref e) = error {
            tracing::debug!(error = %e, "transport terminated");
        }
        let _ = self.tx.send(TransportEvent::Closed(error)).await;
    }

    /// Mark terminated without emitting anything (local close).
    pub fn silence(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Whether the terminal event has been emitted.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Trait for connection transports.
///
/// `connect` may be called again after `close` (or after a terminal event)
/// to establish a fresh connection; each call returns a new inbound channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection kind.
    fn kind(&self) -> TransportKind;

    /// Establish the connection and start producing inbound events.
    async fn connect(&self) -> Result<InboundEvents, TransportError>;

    /// Send one frame. Must fail with `Closed` or `NotConnected` after close,
    /// never panic.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}
