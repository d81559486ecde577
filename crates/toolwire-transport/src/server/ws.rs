//! WebSocket route.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response as HttpResponse},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use toolwire_core::{Frame, SESSION_HEADER, SessionId};

use super::{RelayState, ServerError, bearer, notification_text, session_header};
use crate::{SESSION_NOTIFICATION, STREAM_NOTIFICATION};

/// `GET /ws`
///
/// Resumes the session named in the session header, or opens a new one
/// with the bearer credential. The session id is echoed in the upgrade
/// response and sent as the first notification.
pub(super) async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<HttpResponse, ServerError> {
    let record = match session_header(&headers) {
        Some(session_id) => state.sessions().resume(session_id).await?,
        None => state.sessions().open(bearer(&headers)).await?,
    };
    let header_value = HeaderValue::from_str(&record.session_id)
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    let session_id = record.session_id;
    let mut response = ws
        .on_upgrade(move |socket| serve(socket, state, session_id))
        .into_response();
    response.headers_mut().insert(SESSION_HEADER, header_value);
    Ok(response)
}

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &Frame) {
    match frame.encode() {
        Ok(encoded) => {
            if let Ok(text) = String::from_utf8(encoded.to_vec()) {
                let _ = tx.send(text);
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode reply"),
    }
}

async fn serve(socket: WebSocket, state: RelayState, session_id: SessionId) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let stream_task = match state.sessions().attach_stream(&session_id).await {
        Ok(stream) => {
            let tx = tx.clone();
            Some(tokio::spawn(async move {
                while let Some(message) = stream.recv().await {
                    let Some(text) = notification_text(STREAM_NOTIFICATION, message.payload)
                    else {
                        continue;
                    };
                    if tx.send(text).is_err() {
                        return;
                    }
                }
                tracing::debug!(session_id = %stream.session_id(), "stream ended");
            }))
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "failed to attach stream");
            None
        }
    };

    // The stream is attached before the client learns its session id.
    if let Some(text) = notification_text(
        SESSION_NOTIFICATION,
        json!({ "sessionId": session_id }),
    ) {
        let _ = tx.send(text);
    }
    tracing::info!(session_id = %session_id, "socket connected");

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "websocket error");
                break;
            }
        };

        let frame = match Frame::decode_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "malformed frame");
                continue;
            }
        };
        if let Err(e) = state.sessions().store().touch(&session_id).await {
            tracing::debug!(session_id = %session_id, error = %e, "failed to touch session");
        }

        match frame {
            // Requests run concurrently; notifications keep arrival order.
            Frame::Request(_) => {
                let state = state.clone();
                let tx = tx.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    if let Some(reply) = state.dispatch(&session_id, frame).await {
                        send_frame(&tx, &reply);
                    }
                });
            }
            other => {
                state.dispatch(&session_id, other).await;
            }
        }
    }

    if let Some(task) = stream_task {
        task.abort();
    }
    send_task.abort();
    tracing::info!(session_id = %session_id, "socket disconnected");
}
