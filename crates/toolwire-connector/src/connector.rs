//! Connector: one logical connection to a peer.
//!
//! Wraps a [`Transport`] and a [`CorrelationEngine`] with a lifecycle state
//! machine. One receive loop per live connection feeds responses to the
//! engine and everything else to the [`NotificationRouter`].

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use toolwire_core::{
    BackoffPolicy, Frame, InboundEvents, RequestId, RpcError, Transport, TransportError,
    TransportEvent, TransportKind,
};
use toolwire_transport::{
    HttpTransport, HttpTransportConfig, PipeCommand, PipeTransport, SocketTransport,
    SocketTransportConfig,
};

use crate::{
    config::{ConnectorConfig, InitializeConfig},
    correlation::{CorrelationEngine, EngineStats, PendingCall},
    error::ConnectorError,
    router::{HandlerId, InboundMessage, NotificationHandler, NotificationRouter},
};

/// Connector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        })
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), ConnectorError>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    name: String,
    transport: Arc<dyn Transport>,
    config: ConnectorConfig,
    engine: Arc<CorrelationEngine>,
    router: NotificationRouter,
    state: watch::Sender<ConnectorState>,
    /// In-flight connect or reconnect, tagged so only its owner clears it.
    connecting: Mutex<Option<(u64, ConnectFuture)>>,
    attempt_seq: AtomicU64,
    receive_task: Mutex<Option<(u64, JoinHandle<()>)>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    peer_info: Mutex<Option<Value>>,
    /// Bumped for every connection and every local close; receive loops
    /// from older epochs are ignored.
    epoch: AtomicU64,
}

impl Inner {
    fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(connector = %self.name, from = %previous, to = %next, "state changed");
        }
    }

    /// Move from `from` to `to` only if the state is still `from`.
    fn transition(&self, from: ConnectorState, to: ConnectorState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(connector = %self.name, from = %from, to = %to, "state changed");
        }
        moved
    }

    fn clear_connecting(&self, seq: u64) {
        let mut slot = lock(&self.connecting);
        if slot.as_ref().is_some_and(|(owner, _)| *owner == seq) {
            slot.take();
        }
    }

    fn abort_receive_loop(&self) {
        if let Some((_, task)) = lock(&self.receive_task).take() {
            task.abort();
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), ConnectorError> {
        let encoded = frame.encode()?;
        self.transport.send(encoded).await?;
        Ok(())
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<PendingCall, ConnectorError> {
        let call = self.engine.register(method, timeout)?;
        let frame = Frame::request(call.id().clone(), method, params);
        // The deadline covers the send too. A failed send drops `call`,
        // which removes it from the table.
        match tokio::time::timeout_at(call.deadline(), self.send_frame(&frame)).await {
            Ok(sent) => sent?,
            Err(_) => {
                tracing::debug!(connector = %self.name, request_id = %call.id(), method, "send outlived deadline");
                return Err(call.expire());
            }
        }
        tracing::debug!(connector = %self.name, request_id = %call.id(), method, "request sent");
        Ok(call)
    }

    /// One connect attempt: transport, receive loop, optional handshake.
    /// The caller owns the `connecting` state; success promotes it to
    /// `connected`.
    async fn attempt(self: &Arc<Self>) -> Result<(), ConnectorError> {
        self.engine.reopen();
        let connect_timeout = self.config.connect_timeout();
        let events = match tokio::time::timeout(connect_timeout, self.transport.connect()).await {
            Ok(events) => events?,
            Err(_) => {
                return Err(ConnectorError::ConnectFailed {
                    attempts: 1,
                    reason: format!(
                        "connect timed out after {}ms",
                        self.config.connect_timeout_ms
                    ),
                });
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_receive_loop(events, epoch);

        if let Some(initialize) = &self.config.initialize {
            if let Err(e) = self.handshake(initialize).await {
                self.teardown().await;
                return Err(e);
            }
        }

        if !self.transition(ConnectorState::Connecting, ConnectorState::Connected) {
            let state = self.state();
            self.teardown().await;
            return Err(ConnectorError::NotConnected(state));
        }
        tracing::info!(
            connector = %self.name,
            transport = ?self.transport.kind(),
            "connected"
        );
        Ok(())
    }

    async fn handshake(&self, initialize: &InitializeConfig) -> Result<(), ConnectorError> {
        let call = self
            .call(
                &initialize.method,
                initialize.params.clone(),
                self.config.request_timeout(),
            )
            .await?;
        let info = call.wait().await?;
        *lock(&self.peer_info) = Some(info);

        if let Some(method) = &initialize.initialized_method {
            self.send_frame(&Frame::notification(method.as_str(), None))
                .await?;
        }
        tracing::debug!(connector = %self.name, "handshake complete");
        Ok(())
    }

    async fn teardown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.abort_receive_loop();
        self.engine.close(&ConnectorError::ConnectionClosed);
        if let Err(e) = self.transport.close().await {
            tracing::debug!(connector = %self.name, error = %e, "transport close failed");
        }
    }

    fn spawn_receive_loop(self: &Arc<Self>, mut events: InboundEvents, epoch: u64) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let reason = loop {
                let Some(event) = events.recv().await else {
                    break Some(TransportError::UnexpectedClose(
                        "transport dropped its event channel".to_string(),
                    ));
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Frame(bytes) => inner.handle_frame(&bytes),
                    TransportEvent::Closed(reason) => break reason,
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_closed(epoch, reason);
            }
        });

        let mut slot = lock(&self.receive_task);
        let newer_registered = slot.as_ref().is_some_and(|(current, _)| *current > epoch);
        if !newer_registered {
            if let Some((_, stale)) = slot.replace((epoch, task)) {
                stale.abort();
            }
        }
    }

    fn handle_frame(&self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(Frame::Response(response)) => {
                self.engine.resolve(response);
            }
            Ok(Frame::Notification(notification)) => {
                self.router
                    .dispatch(&InboundMessage::Notification(notification));
            }
            Ok(Frame::Request(request)) => {
                self.router.dispatch(&InboundMessage::Request(request));
            }
            Err(e) => {
                tracing::warn!(connector = %self.name, error = %e, "dropping malformed frame");
            }
        }
    }

    fn on_transport_closed(self: &Arc<Self>, epoch: u64, reason: Option<TransportError>) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        {
            let mut slot = lock(&self.receive_task);
            if slot.as_ref().is_some_and(|(current, _)| *current == epoch) {
                slot.take();
            }
        }

        let failed = self.engine.close(&ConnectorError::ConnectionClosed);
        match &reason {
            Some(e) => tracing::warn!(connector = %self.name, error = %e, failed, "connection lost"),
            None => tracing::info!(connector = %self.name, failed, "peer closed the connection"),
        }

        // While connecting, the attempt in progress owns the state.
        if self.state() != ConnectorState::Connected {
            return;
        }
        match self.config.reconnect.clone() {
            Some(policy) => self.start_reconnect(policy),
            None => {
                let next = if reason.is_some() {
                    ConnectorState::Failed
                } else {
                    ConnectorState::Closed
                };
                self.transition(ConnectorState::Connected, next);
            }
        }
    }

    fn start_reconnect(self: &Arc<Self>, policy: BackoffPolicy) {
        // Held across the transition so `connect` never sees `connecting`
        // without the attempt to join.
        let mut slot = lock(&self.connecting);
        if !self.transition(ConnectorState::Connected, ConnectorState::Connecting) {
            return;
        }
        let seq = self.attempt_seq.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let future = async move {
            let result = Self::reconnect(&weak, &policy).await;
            if let Some(inner) = weak.upgrade() {
                inner.clear_connecting(seq);
            }
            result
        }
        .boxed()
        .shared();

        *slot = Some((seq, future.clone()));
        drop(slot);
        let task = tokio::spawn(async move {
            let _ = future.await;
        });
        if let Some(previous) = lock(&self.reconnect_task).replace(task) {
            previous.abort();
        }
    }

    async fn reconnect(weak: &Weak<Self>, policy: &BackoffPolicy) -> Result<(), ConnectorError> {
        let mut attempts = 0;
        let mut last_error = String::from("no reconnect attempts allowed");

        for delay in policy.delays() {
            attempts += 1;
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return Err(ConnectorError::ConnectionClosed);
            };
            let state = inner.state();
            if state != ConnectorState::Connecting {
                return Err(ConnectorError::NotConnected(state));
            }
            match inner.attempt().await {
                Ok(()) => {
                    tracing::info!(connector = %inner.name, attempts, "reconnected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        connector = %inner.name,
                        attempt = attempts,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        let error = ConnectorError::ConnectFailed {
            attempts,
            reason: last_error,
        };
        if let Some(inner) = weak.upgrade() {
            if inner.transition(ConnectorState::Connecting, ConnectorState::Failed) {
                tracing::error!(connector = %inner.name, error = %error, "giving up on reconnect");
            }
        }
        Err(error)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let receive = self
            .receive_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((_, task)) = receive.take() {
            task.abort();
        }
        let reconnect = self
            .reconnect_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = reconnect.take() {
            task.abort();
        }
    }
}

/// Client-side handle exposing request/notify over one transport.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.inner.name)
            .field("transport", &self.inner.transport.kind())
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Create a disconnected connector over `transport`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: ConnectorConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                transport,
                config,
                engine: Arc::new(CorrelationEngine::new()),
                router: NotificationRouter::new(),
                state,
                connecting: Mutex::new(None),
                attempt_seq: AtomicU64::new(0),
                receive_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                peer_info: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Connector over a child process.
    #[must_use]
    pub fn pipe(name: impl Into<String>, command: PipeCommand, config: ConnectorConfig) -> Self {
        Self::new(name, Arc::new(PipeTransport::new(command)), config)
    }

    /// Connector over HTTP with a server-sent event stream.
    #[must_use]
    pub fn http(
        name: impl Into<String>,
        transport: HttpTransportConfig,
        config: ConnectorConfig,
    ) -> Self {
        Self::new(
            name,
            Arc::new(HttpTransport::new(transport)),
            config,
        )
    }

    /// Connector over a WebSocket.
    #[must_use]
    pub fn socket(
        name: impl Into<String>,
        transport: SocketTransportConfig,
        config: ConnectorConfig,
    ) -> Self {
        Self::new(
            name,
            Arc::new(SocketTransport::new(transport)),
            config,
        )
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    #[must_use]
    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectorState {
        self.inner.state()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state.subscribe()
    }

    /// Result of the initialize handshake, if one was configured.
    #[must_use]
    pub fn peer_info(&self) -> Option<Value> {
        lock(&self.inner.peer_info).clone()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.inner.engine.stats()
    }

    /// Connect, or join the connect attempt already in flight.
    ///
    /// Returns immediately when already connected.
    ///
    /// # Errors
    /// Returns the attempt's error, shared by every caller awaiting it.
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        let future = {
            let mut slot = lock(&self.inner.connecting);
            if let Some((_, future)) = slot.as_ref() {
                future.clone()
            } else {
                match self.inner.state() {
                    ConnectorState::Connected => return Ok(()),
                    ConnectorState::Closing => {
                        return Err(ConnectorError::NotConnected(ConnectorState::Closing));
                    }
                    _ => {}
                }
                self.inner.set_state(ConnectorState::Connecting);

                let seq = self.inner.attempt_seq.fetch_add(1, Ordering::SeqCst);
                let inner = Arc::clone(&self.inner);
                let future = async move {
                    let result = inner.attempt().await;
                    if let Err(e) = &result {
                        tracing::warn!(connector = %inner.name, error = %e, "connect failed");
                        inner.transition(ConnectorState::Connecting, ConnectorState::Failed);
                    }
                    inner.clear_connecting(seq);
                    result
                }
                .boxed()
                .shared();
                *slot = Some((seq, future.clone()));
                future
            }
        };
        future.await
    }

    /// Stop accepting requests, reject everything pending, close the
    /// transport. A no-op when already disconnected or closed.
    ///
    /// # Errors
    /// Returns the transport's close error; the connector is closed anyway.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        let inner = &self.inner;
        let mut closing = false;
        inner.state.send_if_modified(|state| match state {
            ConnectorState::Disconnected | ConnectorState::Closing | ConnectorState::Closed => {
                false
            }
            _ => {
                *state = ConnectorState::Closing;
                closing = true;
                true
            }
        });
        if !closing {
            return Ok(());
        }

        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = lock(&inner.reconnect_task).take() {
            task.abort();
        }
        lock(&inner.connecting).take();
        inner.abort_receive_loop();
        let failed = inner.engine.close(&ConnectorError::ConnectionClosed);

        let result = inner.transport.close().await;
        inner.set_state(ConnectorState::Closed);
        tracing::info!(connector = %inner.name, failed, "disconnected");
        result.map_err(ConnectorError::from)
    }

    fn ensure_connected(&self) -> Result<(), ConnectorError> {
        match self.inner.state() {
            ConnectorState::Connected => Ok(()),
            other => Err(ConnectorError::NotConnected(other)),
        }
    }

    /// Send a request and wait for its response with the default timeout.
    ///
    /// # Errors
    /// Returns `NotConnected`, `Timeout`, `Rpc`, `ConnectionClosed` or a
    /// transport error.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        self.send_request(method, params, None).await?.wait().await
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ConnectorError> {
        self.send_request(method, params, Some(timeout))
            .await?
            .wait()
            .await
    }

    /// Send a request and return its waiter, so the caller can learn its id
    /// and cancel it.
    ///
    /// # Errors
    /// Returns `NotConnected` or the transport's send error.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, ConnectorError> {
        self.ensure_connected()?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        self.inner.call(method, params, timeout).await
    }

    /// Cancel one in-flight request. The connection stays open.
    ///
    /// Returns whether the request was still pending. When a cancel method
    /// is configured the peer is told.
    ///
    /// # Errors
    /// Returns the transport's send error for the cancel notice.
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) -> Result<bool, ConnectorError> {
        if !self.inner.engine.cancel(id) {
            return Ok(false);
        }
        let Some(method) = &self.inner.config.cancel_method else {
            return Ok(true);
        };
        if self.ensure_connected().is_err() {
            return Ok(true);
        }

        let mut params = Map::new();
        params.insert(
            "requestId".to_string(),
            serde_json::to_value(id).map_err(|e| ConnectorError::Protocol(e.to_string()))?,
        );
        if let Some(reason) = reason {
            params.insert("reason".to_string(), Value::String(reason.to_string()));
        }
        self.inner
            .send_frame(&Frame::notification(
                method.as_str(),
                Some(Value::Object(params)),
            ))
            .await?;
        Ok(true)
    }

    /// Send a notification. No response is expected.
    ///
    /// # Errors
    /// Returns `NotConnected` or the transport's send error.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        self.inner
            .send_frame(&Frame::notification(method, params))
            .await
    }

    /// Answer a request the peer sent.
    ///
    /// # Errors
    /// Returns `NotConnected` or the transport's send error.
    pub async fn respond(
        &self,
        id: RequestId,
        outcome: Result<Value, RpcError>,
    ) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        let frame = match outcome {
            Ok(result) => Frame::result(id, result),
            Err(error) => Frame::error(id, error),
        };
        self.inner.send_frame(&frame).await
    }

    /// Receive every inbound notification and peer request, in order.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        self.inner.router.subscribe()
    }

    pub fn add_handler(&self, handler: impl NotificationHandler + 'static) -> HandlerId {
        self.inner.router.add_handler(handler)
    }

    pub fn add_method_handler(
        &self,
        method: impl Into<String>,
        handler: impl NotificationHandler + 'static,
    ) -> HandlerId {
        self.inner.router.add_method_handler(method, handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.router.remove_handler(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use serde_json::json;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};
    use toolwire_core::{ChannelTransport, Request};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    struct Peer {
        transport: ChannelTransport,
        inbound: InboundEvents,
    }

    impl Peer {
        async fn next(&mut self) -> Frame {
            match timeout(WAIT, self.inbound.recv()).await.unwrap() {
                Some(TransportEvent::Frame(bytes)) => Frame::decode(&bytes).unwrap(),
                other => panic!("expected a frame, got {other:?}"),
            }
        }

        async fn next_request(&mut self) -> Request {
            match self.next().await {
                Frame::Request(request) => request,
                other => panic!("expected a request, got {other:?}"),
            }
        }

        async fn send(&self, frame: Frame) {
            self.transport.send(frame.encode().unwrap()).await.unwrap();
        }

        /// Answer one echo round-trip so everything sent before it has been
        /// processed by the connector's receive loop.
        async fn sync(&mut self, connector: &Connector) {
            let call = connector.send_request("sync", None, None).await.unwrap();
            let request = self.next_request().await;
            self.send(Frame::result(request.id, Value::Null)).await;
            call.wait().await.unwrap();
        }
    }

    async fn connected(config: ConnectorConfig) -> (Connector, Peer) {
        let (local, remote) = ChannelTransport::pair();
        let connector = Connector::new("test", Arc::new(local), config);
        let inbound = remote.connect().await.unwrap();
        connector.connect().await.unwrap();
        (
            connector,
            Peer {
                transport: remote,
                inbound,
            },
        )
    }

    async fn wait_for_state(connector: &Connector, wanted: ConnectorState) {
        let mut state = connector.watch_state();
        timeout(WAIT, state.wait_for(|s| *s == wanted))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_responses_resolve_out_of_order() {
        let (connector, mut peer) = connected(ConnectorConfig::default()).await;
        let first = connector.send_request("a", None, None).await.unwrap();
        let second = connector.send_request("b", None, None).await.unwrap();

        let a = peer.next_request().await;
        let b = peer.next_request().await;
        peer.send(Frame::result(b.id, json!("b"))).await;
        peer.send(Frame::result(a.id, json!("a"))).await;

        assert_eq!(second.wait().await.unwrap(), json!("b"));
        assert_eq!(first.wait().await.unwrap(), json!("a"));
        assert_eq!(connector.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let (local, remote) = ChannelTransport::pair();
        let _inbound = remote.connect().await.unwrap();
        let connector = Connector::new("test", Arc::new(local), ConnectorConfig::default());

        // A channel end connects only once, so a second attempt would fail.
        let (a, b) = tokio::join!(connector.connect(), connector.connect());
        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(connector.state(), ConnectorState::Connected);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (local, _remote) = ChannelTransport::pair();
        let connector = Connector::new("test", Arc::new(local), ConnectorConfig::default());

        assert_eq!(
            connector.request("x", None).await,
            Err(ConnectorError::NotConnected(ConnectorState::Disconnected))
        );
        assert_eq!(
            connector.notify("x", None).await,
            Err(ConnectorError::NotConnected(ConnectorState::Disconnected))
        );
        assert_ok!(connector.disconnect().await);
        assert_err!(connector.send_request("x", None, None).await);
    }

    #[tokio::test]
    async fn test_failed_connect_lands_in_failed() {
        let (local, _remote) = ChannelTransport::pair();
        let transport: Arc<dyn Transport> = Arc::new(local);
        let _first = transport.connect().await.unwrap();

        let connector = Connector::new("test", transport, ConnectorConfig::default());
        assert!(matches!(
            connector.connect().await,
            Err(ConnectorError::Transport(TransportError::ConnectFailed(_)))
        ));
        assert_eq!(connector.state(), ConnectorState::Failed);
    }

    #[tokio::test]
    async fn test_peer_close_rejects_pending_requests() {
        let (connector, mut peer) = connected(ConnectorConfig::default()).await;
        let call = connector.send_request("slow", None, None).await.unwrap();
        peer.next_request().await;

        peer.transport.close().await.unwrap();
        assert_eq!(call.wait().await, Err(ConnectorError::ConnectionClosed));
        wait_for_state(&connector, ConnectorState::Closed).await;
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_and_is_idempotent() {
        let (connector, _peer) = connected(ConnectorConfig::default()).await;
        let call = connector.send_request("slow", None, None).await.unwrap();

        connector.disconnect().await.unwrap();
        assert_eq!(call.wait().await, Err(ConnectorError::ConnectionClosed));
        assert_eq!(connector.state(), ConnectorState::Closed);

        assert_ok!(connector.disconnect().await);
        assert_eq!(
            connector.request("x", None).await,
            Err(ConnectorError::NotConnected(ConnectorState::Closed))
        );
    }

    #[tokio::test]
    async fn test_timeout_keeps_connection_and_late_response_is_dropped() {
        let (connector, mut peer) = connected(ConnectorConfig::default()).await;

        let err = connector
            .request_with_timeout("slow", None, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { ref method, timeout_ms: 30 } if method == "slow"));
        assert_eq!(connector.stats().pending, 0);

        let slow = peer.next_request().await;
        peer.send(Frame::result(slow.id, json!("too late"))).await;
        peer.sync(&connector).await;

        let stats = connector.stats();
        assert_eq!(stats.late_responses, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(connector.state(), ConnectorState::Connected);
    }

    /// Accepts a connection, then never finishes a send.
    #[derive(Default)]
    struct StalledTransport {
        sink: Mutex<Option<toolwire_core::EventSink>>,
    }

    #[async_trait::async_trait]
    impl Transport for StalledTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Channel
        }

        async fn connect(&self) -> Result<InboundEvents, TransportError> {
            let (sink, inbound) = toolwire_core::EventSink::channel();
            *lock(&self.sink) = Some(sink);
            Ok(inbound)
        }

        async fn send(&self, _frame: Bytes) -> Result<(), TransportError> {
            futures::future::pending().await
        }

        async fn close(&self) -> Result<(), TransportError> {
            let sink = lock(&self.sink).take();
            if let Some(sink) = sink {
                sink.terminate(None).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deadline_covers_a_stalled_send() {
        let connector = Connector::new(
            "test",
            Arc::new(StalledTransport::default()),
            ConnectorConfig::default(),
        );
        connector.connect().await.unwrap();

        let err = timeout(
            Duration::from_secs(1),
            connector.request_with_timeout("slow", None, Duration::from_millis(50)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { timeout_ms: 50, .. }));

        let stats = connector.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.abandoned, 0);
        assert_ok!(timeout(Duration::from_secs(1), connector.disconnect()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_notifies_peer() {
        let (connector, mut peer) = connected(ConnectorConfig::default()).await;
        let call = connector.send_request("slow", None, None).await.unwrap();
        let id = call.id().clone();
        peer.next_request().await;

        assert!(connector.cancel(&id, Some("user")).await.unwrap());
        assert!(!connector.cancel(&id, None).await.unwrap());
        assert_eq!(call.wait().await, Err(ConnectorError::Cancelled));

        assert_eq!(
            peer.next().await,
            Frame::notification(
                "notifications/cancelled",
                Some(json!({ "requestId": id, "reason": "user" }))
            )
        );
        assert_eq!(connector.state(), ConnectorState::Connected);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_counted() {
        let (connector, mut peer) = connected(ConnectorConfig::default()).await;
        peer.send(Frame::result(RequestId::Number(999), Value::Null))
            .await;
        peer.sync(&connector).await;
        assert_eq!(connector.stats().unmatched_responses, 1);
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let (connector, peer) = connected(ConnectorConfig::default()).await;
        let mut inbound = connector.subscribe();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        connector.add_method_handler("tick", move |_: &InboundMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for seq in 0..50 {
            peer.send(Frame::notification("tick", Some(json!({ "seq": seq }))))
                .await;
        }
        for seq in 0..50 {
            let message = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
            assert_eq!(message.method(), "tick");
            assert_eq!(message.params(), Some(&json!({ "seq": seq })));
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (connector, peer) = connected(ConnectorConfig::default()).await;
        let mut inbound = connector.subscribe();

        peer.transport
            .send(Bytes::from_static(b"not json"))
            .await
            .unwrap();
        peer.send(Frame::notification("after", None)).await;

        let message = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(message.method(), "after");
    }

    #[tokio::test]
    async fn test_peer_request_is_answered_with_respond() {
        let (connector, mut peer) = connected(ConnectorConfig::default()).await;
        let mut inbound = connector.subscribe();

        peer.send(Frame::request("srv-1", "confirm", Some(json!({"prompt": "ok?"}))))
            .await;
        let InboundMessage::Request(request) = timeout(WAIT, inbound.recv()).await.unwrap().unwrap()
        else {
            panic!("expected a peer request");
        };
        assert_eq!(request.method, "confirm");

        connector
            .respond(request.id, Ok(json!({ "confirmed": true })))
            .await
            .unwrap();
        assert_eq!(
            peer.next().await,
            Frame::result(RequestId::from("srv-1"), json!({ "confirmed": true }))
        );
    }

    #[tokio::test]
    async fn test_initialize_handshake_runs_before_connected() {
        let (local, remote) = ChannelTransport::pair();
        let mut peer = Peer {
            inbound: remote.connect().await.unwrap(),
            transport: remote,
        };
        let config = ConnectorConfig::default()
            .with_initialize(InitializeConfig::default().with_params(json!({ "client": "test" })));
        let connector = Connector::new("test", Arc::new(local), config);

        let connecting = tokio::spawn({
            let connector = connector.clone();
            async move { connector.connect().await }
        });

        let init = peer.next_request().await;
        assert_eq!(init.method, "initialize");
        assert_eq!(init.params, Some(json!({ "client": "test" })));
        assert_eq!(connector.state(), ConnectorState::Connecting);
        peer.send(Frame::result(init.id, json!({ "capabilities": { "tools": true } })))
            .await;

        assert_eq!(
            peer.next().await,
            Frame::notification("notifications/initialized", None)
        );
        connecting.await.unwrap().unwrap();
        assert_eq!(connector.state(), ConnectorState::Connected);
        assert_eq!(
            connector.peer_info(),
            Some(json!({ "capabilities": { "tools": true } }))
        );
    }

    #[tokio::test]
    async fn test_rejected_handshake_fails_connect() {
        let (local, remote) = ChannelTransport::pair();
        let mut peer = Peer {
            inbound: remote.connect().await.unwrap(),
            transport: remote,
        };
        let connector = Connector::new(
            "test",
            Arc::new(local),
            ConnectorConfig::default().with_initialize(InitializeConfig::default()),
        );

        let connecting = tokio::spawn({
            let connector = connector.clone();
            async move { connector.connect().await }
        });
        let init = peer.next_request().await;
        peer.send(Frame::error(init.id, RpcError::invalid_params("bad version")))
            .await;

        assert!(matches!(
            connecting.await.unwrap(),
            Err(ConnectorError::Rpc(_))
        ));
        assert_eq!(connector.state(), ConnectorState::Failed);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let config = ConnectorConfig::default()
            .with_reconnect(BackoffPolicy::fixed(2, Duration::from_millis(100)));
        let (connector, peer) = connected(config).await;

        peer.transport.close().await.unwrap();
        wait_for_state(&connector, ConnectorState::Connecting).await;

        // Joins the reconnect already in flight. A channel end cannot be
        // reconnected, so every attempt fails.
        assert_eq!(
            connector.connect().await,
            Err(ConnectorError::ConnectFailed {
                attempts: 2,
                reason: "Transport error: Connect failed: channel end already connected or closed"
                    .to_string(),
            })
        );
        assert_eq!(connector.state(), ConnectorState::Failed);
    }
}
