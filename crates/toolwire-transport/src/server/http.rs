//! HTTP routes: session lifecycle, request/response, and the SSE stream.

use std::convert::Infallible;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{
        IntoResponse, Response as HttpResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use serde_json::json;
use toolwire_core::{Frame, SESSION_HEADER};

use super::{RelayState, ServerError, bearer, notification_text, session_header};
use crate::STREAM_NOTIFICATION;

fn required_session(headers: &HeaderMap) -> Result<&str, ServerError> {
    session_header(headers).ok_or(ServerError::MissingSession)
}

/// `POST /session`
pub(super) async fn open_session(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServerError> {
    let record = state.sessions().open(bearer(&headers)).await?;
    Ok((
        [(SESSION_HEADER, record.session_id.clone())],
        Json(json!({ "sessionId": record.session_id })),
    ))
}

/// `DELETE /session`
pub(super) async fn close_session(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<StatusCode, ServerError> {
    let session_id = required_session(&headers)?;
    state.sessions().close(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /rpc`
pub(super) async fn rpc(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<HttpResponse, ServerError> {
    let session_id = required_session(&headers)?;
    state.sessions().resume(session_id).await?;
    let frame = Frame::decode(&body)?;

    match state.dispatch(session_id, frame).await {
        Some(reply) => {
            let encoded = reply
                .encode()
                .map_err(|e| ServerError::Internal(e.to_string()))?;
            Ok(([(CONTENT_TYPE, "application/json")], encoded).into_response())
        }
        None => Ok(StatusCode::ACCEPTED.into_response()),
    }
}

/// `GET /stream`
pub(super) async fn stream(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let session_id = required_session(&headers)?;
    state.sessions().resume(session_id).await?;
    let stream = state.sessions().attach_stream(session_id).await?;
    tracing::debug!(session_id, "event stream attached");

    let events = stream.into_stream().filter_map(|message| async move {
        notification_text(STREAM_NOTIFICATION, message.payload)
            .map(|text| Ok(Event::default().data(text)))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
