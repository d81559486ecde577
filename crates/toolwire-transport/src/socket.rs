//! WebSocket transport.
//!
//! One physical connection carries every frame in both directions, one JSON
//! object per text message.

use std::{
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use toolwire_core::{
    EventSink, InboundEvents, SESSION_HEADER, SessionId, Transport, TransportError, TransportKind,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames queued for the socket before `send` waits.
const OUTBOUND_CAPACITY: usize = 256;

/// How long `close` lets the writer say goodbye before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketTransportConfig {
    /// Endpoint URL, for example `ws://127.0.0.1:8080/ws`.
    pub url: String,
    /// Bearer credential presented on upgrade.
    pub credential: Option<String>,
    /// Session to resume instead of opening a new one.
    pub session_id: Option<SessionId>,
}

impl SocketTransportConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

struct Writer {
    frames: mpsc::Sender<Message>,
    events: EventSink,
    task: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Writer {
    fn abort(&self) {
        self.task.abort();
        self.reader.abort();
    }
}

/// Full-duplex WebSocket transport.
pub struct SocketTransport {
    config: SocketTransportConfig,
    session_id: Mutex<Option<SessionId>>,
    writer: Mutex<Option<Writer>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn connect_failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectFailed(e.to_string())
}

impl SocketTransport {
    #[must_use]
    pub fn new(config: SocketTransportConfig) -> Self {
        let session_id = config.session_id.clone();
        Self {
            config,
            session_id: Mutex::new(session_id),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Session assigned by the server on upgrade, once known.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session_id(&self, session_id: SessionId) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(session_id);
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn connect(&self) -> Result<InboundEvents, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(connect_failed)?;
        if let Some(token) = &self.config.credential {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(connect_failed)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        if let Some(session_id) = self.session_id() {
            let value = HeaderValue::from_str(&session_id).map_err(connect_failed)?;
            request.headers_mut().insert(SESSION_HEADER, value);
        }

        let (socket, response) = connect_async(request).await.map_err(connect_failed)?;
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session_id(session_id.to_string());
        }

        let (sink, stream) = socket.split();
        let (events, inbound) = EventSink::channel();
        let reader = tokio::spawn(read_messages(stream, events.clone()));
        let (frames, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
        let task = tokio::spawn(write_messages(sink, outbound, events.clone()));

        if let Some(stale) = lock(&self.writer).replace(Writer {
            frames,
            events,
            task,
            reader,
        }) {
            stale.events.silence();
            stale.abort();
        }
        self.closed.store(false, Ordering::SeqCst);
        tracing::info!(url = %self.config.url, session_id = ?self.session_id(), "socket transport connected");
        Ok(inbound)
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let text = std::str::from_utf8(&frame)
            .map_err(|e| TransportError::Write(e.to_string()))?
            .to_owned();

        let frames = {
            let writer = lock(&self.writer);
            let Some(writer) = writer.as_ref() else {
                return Err(if self.closed.load(Ordering::SeqCst) {
                    TransportError::Closed
                } else {
                    TransportError::NotConnected
                });
            };
            if writer.events.is_terminated() {
                return Err(TransportError::Closed);
            }
            writer.frames.clone()
        };
        frames
            .send(Message::text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let Some(writer) = lock(&self.writer).take() else {
            return Ok(());
        };
        writer.events.terminate(None).await;
        let Writer {
            frames,
            task,
            reader,
            ..
        } = writer;
        // The writer sends a close frame once its queue is drained.
        drop(frames);
        let abort = task.abort_handle();
        if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
            tracing::debug!(url = %self.config.url, "socket writer stalled, aborting");
            abort.abort();
        }
        reader.abort();
        tracing::debug!(url = %self.config.url, "socket transport closed");
        Ok(())
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let writer = self.writer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = writer.take() {
            writer.abort();
        }
    }
}

async fn write_messages(
    mut sink: SplitSink<Socket, Message>,
    mut frames: mpsc::Receiver<Message>,
    events: EventSink,
) {
    while let Some(message) = frames.recv().await {
        if let Err(e) = sink.send(message).await {
            events
                .terminate(Some(TransportError::Write(e.to_string())))
                .await;
            return;
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "failed to send close frame");
    }
    let _ = sink.close().await;
}

async fn read_messages(mut stream: SplitStream<Socket>, events: EventSink) {
    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(reason)) => {
                let reason = reason.map_or_else(String::new, |r| r.reason.to_string());
                events
                    .terminate(Some(TransportError::UnexpectedClose(format!(
                        "peer closed the socket {reason}"
                    ))))
                    .await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                events
                    .terminate(Some(TransportError::UnexpectedClose(e.to_string())))
                    .await;
                return;
            }
        };
        if !events.frame(frame).await {
            return;
        }
    }
    events
        .terminate(Some(TransportError::UnexpectedClose(
            "socket ended".to_string(),
        )))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = SocketTransport::new(SocketTransportConfig::new("ws://127.0.0.1:1/ws"));
        assert_eq!(
            transport.send(Bytes::from_static(b"{}")).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails_cleanly() {
        let transport = SocketTransport::new(SocketTransportConfig::new("ws://127.0.0.1:1/ws"));
        transport.close().await.unwrap();
        assert_eq!(
            transport.send(Bytes::from_static(b"{}")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_to_connect() {
        let transport = SocketTransport::new(SocketTransportConfig::new("ws://127.0.0.1:1/ws"));
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
