//! Server accept path.
//!
//! An axum router terminating socket and HTTP clients:
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /ws` | WebSocket upgrade; opens or resumes a session |
//! | `POST /session` | Open a session |
//! | `DELETE /session` | Close a session |
//! | `POST /rpc` | One frame in, one frame out |
//! | `GET /stream` | Server-sent events carrying the session's stream |
//!
//! Requests are dispatched to a [`RequestHandler`] behind a semaphore bounding
//! how many run at once.

mod http;
mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;
use toolwire_core::{
    AuthError, Frame, ProtocolError, Response, RpcError, SESSION_HEADER, SessionError, SessionId,
};
use toolwire_session::{ManagerError, PublishReceipt, SessionManager};
use tower_http::trace::TraceLayer;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Requests handled concurrently across all connections.
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 64,
        }
    }
}

/// Per-call context handed to a [`RequestHandler`].
#[derive(Clone)]
pub struct RequestContext {
    pub session_id: SessionId,
    pub sessions: Arc<SessionManager>,
}

impl RequestContext {
    /// Push a message onto this session's stream.
    ///
    /// # Errors
    /// Returns error per the stream delivery policy.
    pub async fn publish(&self, payload: Value) -> Result<PublishReceipt, ManagerError> {
        self.sessions.publish(&self.session_id, payload).await
    }
}

/// Application logic behind the relay.
///
/// Unknown methods should answer with [`RpcError::method_not_found`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request and produce its result.
    async fn handle_request(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError>;

    /// Handle a notification. Ignored by default.
    async fn handle_notification(&self, ctx: &RequestContext, method: &str, _params: Option<Value>) {
        tracing::debug!(session_id = %ctx.session_id, method, "unhandled notification");
    }

    /// Handle a client's response to a server-initiated request. Ignored by
    /// default.
    async fn handle_response(&self, ctx: &RequestContext, response: Response) {
        tracing::debug!(session_id = %ctx.session_id, id = %response.id, "unhandled response");
    }
}

/// Handler that knows no methods.
#[derive(Debug, Default, Clone)]
pub struct NoMethods;

#[async_trait]
impl RequestHandler for NoMethods {
    async fn handle_request(
        &self,
        _ctx: &RequestContext,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, RpcError> {
        Err(RpcError::method_not_found(method))
    }
}

/// Server error.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("Missing x-session-id header")]
    MissingSession,
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Bad frame: {0}")]
    BadFrame(#[from] ProtocolError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ManagerError> for ServerError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::Auth(e) => Self::Unauthorized(e),
            ManagerError::Session(SessionError::NotFound(id)) => Self::SessionNotFound(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> HttpResponse {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::MissingSession | Self::BadFrame(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

struct RelayInner {
    sessions: Arc<SessionManager>,
    handler: Arc<dyn RequestHandler>,
    permits: Semaphore,
}

/// Shared router state.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

impl RelayState {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        handler: Arc<dyn RequestHandler>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                sessions,
                handler,
                permits: Semaphore::new(config.max_concurrent_requests.max(1)),
            }),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    fn context(&self, session_id: &str) -> RequestContext {
        RequestContext {
            session_id: session_id.to_string(),
            sessions: Arc::clone(&self.inner.sessions),
        }
    }

    /// Route one inbound frame. Requests yield the response to send back.
    pub async fn dispatch(&self, session_id: &str, frame: Frame) -> Option<Frame> {
        let ctx = self.context(session_id);
        match frame {
            Frame::Request(request) => {
                let outcome = match self.inner.permits.acquire().await {
                    Ok(_permit) => {
                        self.inner
                            .handler
                            .handle_request(&ctx, &request.method, request.params)
                            .await
                    }
                    Err(_) => Err(RpcError::internal("server shutting down")),
                };
                if let Err(e) = &outcome {
                    tracing::debug!(
                        session_id,
                        method = %request.method,
                        code = e.code,
                        "request failed"
                    );
                }
                Some(Frame::Response(Response {
                    id: request.id,
                    outcome,
                }))
            }
            Frame::Notification(notification) => {
                self.inner
                    .handler
                    .handle_notification(&ctx, &notification.method, notification.params)
                    .await;
                None
            }
            Frame::Response(response) => {
                self.inner.handler.handle_response(&ctx, response).await;
                None
            }
        }
    }
}

/// Build the relay router.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/session", post(http::open_session).delete(http::close_session))
        .route("/rpc", post(http::rpc))
        .route("/stream", get(http::stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer credential from the `Authorization` header.
fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Encode a notification frame as text.
fn notification_text(method: &str, params: Value) -> Option<String> {
    let encoded = Frame::notification(method, Some(params))
        .encode()
        .map_err(|e| tracing::error!(method, error = %e, "failed to encode notification"))
        .ok()?;
    String::from_utf8(encoded.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use toolwire_core::{Identity, RequestId};
    use toolwire_session::{
        MemoryBus, SessionConfig, StaticTokenVerifier, StreamConfig, StreamManager,
        storage::MemorySessionStore,
    };
    use tower::ServiceExt;

    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle_request(
            &self,
            _ctx: &RequestContext,
            method: &str,
            params: Option<Value>,
        ) -> Result<Value, RpcError> {
            match method {
                "echo" => Ok(params.unwrap_or(Value::Null)),
                other => Err(RpcError::method_not_found(other)),
            }
        }
    }

    fn state() -> RelayState {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(StreamManager::new(
                Arc::new(MemoryBus::new()),
                StreamConfig::default(),
            )),
            Arc::new(StaticTokenVerifier::new().with_token("secret", Identity::new("alice"))),
            SessionConfig::default(),
        ));
        RelayState::new(sessions, Arc::new(Echo), &ServerConfig::default())
    }

    async fn open(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(
                Request::post("/session")
                    .header(AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get(SESSION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn rpc(app: &Router, session_id: &str, body: &'static str) -> HttpResponse {
        app.clone()
            .oneshot(
                Request::post("/rpc")
                    .header(SESSION_HEADER, session_id)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_requires_valid_credential() {
        let app = router(state());
        let response = app
            .oneshot(Request::post("/session").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rpc_round_trip() {
        let app = router(state());
        let session_id = open(&app).await;

        let response = rpc(
            &app,
            &session_id,
            r#"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"x":1}}"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            Frame::decode(&body).unwrap(),
            Frame::result(RequestId::Number(7), json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let app = router(state());
        let session_id = open(&app).await;

        let response = rpc(&app, &session_id, r#"{"id":"a","method":"nope"}"#).await;
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        match Frame::decode(&body).unwrap() {
            Frame::Response(Response { outcome: Err(e), .. }) => {
                assert_eq!(e.code, toolwire_core::message::codes::METHOD_NOT_FOUND);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notification_is_accepted() {
        let app = router(state());
        let session_id = open(&app).await;
        let response = rpc(&app, &session_id, r#"{"method":"notifications/hello"}"#).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_rpc_errors() {
        let app = router(state());
        let session_id = open(&app).await;

        assert_eq!(
            rpc(&app, "ghost", r#"{"method":"x"}"#).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            rpc(&app, &session_id, "not json").await.status(),
            StatusCode::BAD_REQUEST
        );
        let response = app
            .clone()
            .oneshot(Request::post("/rpc").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_closes_session() {
        let app = router(state());
        let session_id = open(&app).await;
        let response = app
            .clone()
            .oneshot(
                Request::delete("/session")
                    .header(SESSION_HEADER, &session_id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            rpc(&app, &session_id, r#"{"method":"x"}"#).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer(&headers), Some("abc"));
    }
}
