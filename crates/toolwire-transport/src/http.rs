//! HTTP transport.
//!
//! Every outbound frame is its own `POST /rpc` exchange, run on its own task
//! so `send` never waits for the server; the reply in the response body is
//! fed back as an inbound frame. Exchanges run concurrently, so the server
//! may see frames in a different order than they were sent. Server-originated
//! messages arrive on a long-lived `GET /stream` server-sent event stream.
//! Reconnecting after the stream drops is left to the caller.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode, header};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use toolwire_core::{
    EventSink, Frame, InboundEvents, RpcError, SESSION_HEADER, SessionId, Transport,
    TransportError, TransportKind,
};

/// HTTP transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// Server base URL, for example `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Bearer credential presented when opening a session.
    pub credential: Option<String>,
    /// Session to resume instead of opening a new one.
    pub session_id: Option<SessionId>,
}

impl HttpTransportConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenedSession {
    session_id: SessionId,
}

struct Connection {
    events: EventSink,
    stream_task: JoinHandle<()>,
    /// In-flight `POST /rpc` exchanges; dropped with the connection.
    exchanges: JoinSet<()>,
}

/// HTTP request/response plus SSE transport.
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Client,
    session_id: Mutex<Option<SessionId>>,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

fn http_error(e: &reqwest::Error) -> TransportError {
    TransportError::Http(e.to_string())
}

impl HttpTransport {
    #[must_use]
    pub fn new(config: HttpTransportConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    /// Use a preconfigured `reqwest` client.
    #[must_use]
    pub fn with_client(config: HttpTransportConfig, client: Client) -> Self {
        let session_id = config.session_id.clone();
        Self {
            config,
            client,
            session_id: Mutex::new(session_id),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Session this transport is bound to, once known.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session_id(&self, session_id: Option<SessionId>) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn open_session(&self) -> Result<SessionId, TransportError> {
        let response = self
            .authorized(self.client.post(self.url("/session")))
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::ConnectFailed(format!(
                "opening session returned {status}"
            )));
        }
        let opened: OpenedSession = response
            .json()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        tracing::debug!(session_id = %opened.session_id, "http session opened");
        self.set_session_id(Some(opened.session_id.clone()));
        Ok(opened.session_id)
    }

    async fn request_stream(&self, session_id: &str) -> Result<reqwest::Response, TransportError> {
        self.authorized(self.client.get(self.url("/stream")))
            .header(SESSION_HEADER, session_id)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))
    }

    /// Open the event stream, opening a fresh session if the stored one is
    /// gone.
    async fn open_stream(&self) -> Result<reqwest::Response, TransportError> {
        let session_id = match self.session_id() {
            Some(id) => id,
            None => self.open_session().await?,
        };
        let mut response = self.request_stream(&session_id).await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!(session_id = %session_id, "session expired, opening a new one");
            let session_id = self.open_session().await?;
            response = self.request_stream(&session_id).await?;
        }
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::ConnectFailed(format!(
                "event stream returned {status}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> Result<InboundEvents, TransportError> {
        let mut connection = self.connection.lock().await;
        if let Some(stale) = connection.take() {
            stale.events.silence();
            stale.stream_task.abort();
        }

        let response = self.open_stream().await?;
        let (events, inbound) = EventSink::channel();
        let stream_task = tokio::spawn(pump_events(response, events.clone()));
        *connection = Some(Connection {
            events,
            stream_task,
            exchanges: JoinSet::new(),
        });
        tracing::info!(base_url = %self.config.base_url, "http transport connected");
        Ok(inbound)
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().ok_or(TransportError::NotConnected)?;
        if connection.events.is_terminated() {
            return Err(TransportError::Closed);
        }
        let session_id = self.session_id().ok_or(TransportError::NotConnected)?;

        let request = self
            .authorized(self.client.post(self.url("/rpc")))
            .header(SESSION_HEADER, session_id)
            .header(header::CONTENT_TYPE, "application/json")
            .body(frame.clone());
        while connection.exchanges.try_join_next().is_some() {}
        connection
            .exchanges
            .spawn(exchange(request, frame, connection.events.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        connection.events.terminate(None).await;
        connection.stream_task.abort();
        connection.exchanges.abort_all();

        if let Some(session_id) = self.session_id() {
            let result = self
                .authorized(self.client.delete(self.url("/session")))
                .header(SESSION_HEADER, &session_id)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(session_id = %session_id, error = %e, "failed to close http session");
            }
            self.set_session_id(None);
        }
        tracing::debug!("http transport closed");
        Ok(())
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut() {
            connection.stream_task.abort();
        }
    }
}

/// Run one `POST /rpc` and feed its reply back as an inbound frame.
async fn exchange(request: RequestBuilder, frame: Bytes, events: EventSink) {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            events.terminate(Some(http_error(&e))).await;
            return;
        }
    };

    match response.status() {
        StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {}
        StatusCode::NOT_FOUND => {
            events
                .terminate(Some(TransportError::UnexpectedClose(
                    "session no longer exists".to_string(),
                )))
                .await;
        }
        status if status.is_success() => match response.bytes().await {
            Ok(body) if body.is_empty() => {}
            Ok(body) => {
                events.frame(body).await;
            }
            Err(e) => events.terminate(Some(http_error(&e))).await,
        },
        status => refuse(&frame, status, &events).await,
    }
}

/// Answer a request the server refused, so its caller is not left waiting.
async fn refuse(frame: &Bytes, status: StatusCode, events: &EventSink) {
    tracing::warn!(%status, "rpc exchange refused");
    let Ok(Frame::Request(request)) = Frame::decode(frame) else {
        return;
    };
    let reply = Frame::error(
        request.id,
        RpcError::internal(format!("rpc returned {status}")),
    );
    match reply.encode() {
        Ok(encoded) => {
            events.frame(encoded).await;
        }
        Err(e) => tracing::warn!(error = %e, "failed to encode refusal"),
    }
}

async fn pump_events(response: reqwest::Response, events: EventSink) {
    let mut stream = response.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if event.data.is_empty() {
                    continue;
                }
                if !events.frame(Bytes::from(event.data)).await {
                    return;
                }
            }
            Err(e) => {
                events
                    .terminate(Some(TransportError::UnexpectedClose(format!(
                        "event stream error: {e}"
                    ))))
                    .await;
                return;
            }
        }
    }
    events
        .terminate(Some(TransportError::UnexpectedClose(
            "event stream ended".to_string(),
        )))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_join_without_double_slash() {
        let transport = HttpTransport::new(HttpTransportConfig::new("http://localhost:1/"));
        assert_eq!(transport.url("/rpc"), "http://localhost:1/rpc");
    }

    #[test]
    fn test_configured_session_is_resumed() {
        let config = HttpTransportConfig {
            session_id: Some("s1".to_string()),
            ..HttpTransportConfig::new("http://localhost:1")
        };
        assert_eq!(HttpTransport::new(config).session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = HttpTransport::new(HttpTransportConfig::new("http://localhost:1"));
        assert_eq!(
            transport.send(Bytes::from_static(b"{}")).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_to_connect() {
        let transport = HttpTransport::new(HttpTransportConfig::new("http://127.0.0.1:1"));
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
