//! In-process duplex transport.
//!
//! Two co-located components (for example a host and a sandboxed runtime
//! proxying tool calls) exchange frames over a bounded channel pair instead of
//! shared files.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::transport::{EventSink, InboundEvents, Transport, TransportError, TransportKind};

/// One end of an in-process channel pair.
pub struct ChannelTransport {
    outbound: Mutex<Option<EventSink>>,
    inbound: Mutex<Option<InboundEvents>>,
}

impl ChannelTransport {
    /// Create two connected ends.
    ///
    /// Frames sent on one end arrive on the other. Each end can be connected
    /// once; closing an end delivers an orderly close to its peer.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (sink_a, rx_a) = EventSink::channel();
        let (sink_b, rx_b) = EventSink::channel();
        (
            Self {
                outbound: Mutex::new(Some(sink_b)),
                inbound: Mutex::new(Some(rx_a)),
            },
            Self {
                outbound: Mutex::new(Some(sink_a)),
                inbound: Mutex::new(Some(rx_b)),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    async fn connect(&self) -> Result<InboundEvents, TransportError> {
        self.inbound.lock().await.take().ok_or_else(|| {
            TransportError::ConnectFailed("channel end already connected or closed".to_string())
        })
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let sink = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(TransportError::Closed)?;
        if sink.frame(frame).await {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(sink) = self.outbound.lock().await.take() {
            sink.terminate(None).await;
        }
        self.inbound.lock().await.take();
        Ok(())
    }
}
