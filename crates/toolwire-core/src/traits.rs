//! Core traits for session storage, pub/sub fan-out and authentication.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::{Metadata, SessionId, SessionRecord};

/// Session store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session backend error: {0}")]
    Backend(String),
    #[error("Session metadata encoding error: {0}")]
    Encoding(String),
}

/// Trait for session storage backends.
///
/// Implementations must be safe under concurrent access. Writes are
/// last-writer-wins. Backends that live in process memory are valid for a
/// single instance only.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the session or replace its metadata. `created_at` is kept for
    /// a live session; `last_seen_at` is bumped. An idle-expired session is
    /// replaced by a fresh record.
    async fn set(&self, session_id: &str, metadata: Metadata) -> Result<(), SessionError>;

    /// Get a session. Idle-expired sessions are reported as not found.
    async fn get(&self, session_id: &str) -> Result<SessionRecord, SessionError>;

    /// Delete a session. Deleting a missing session is not an error.
    async fn delete(&self, session_id: &str) -> Result<(), SessionError>;

    /// List live session identifiers.
    async fn list(&self) -> Result<Vec<SessionId>, SessionError>;

    /// Bump `last_seen_at`.
    async fn touch(&self, session_id: &str) -> Result<(), SessionError>;

    /// Remove idle-expired sessions and return their identifiers.
    async fn purge_expired(&self) -> Result<Vec<SessionId>, SessionError>;
}

/// Pub/sub bus error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Bus closed")]
    Closed,
    #[error("Bus backend error: {0}")]
    Backend(String),
}

/// A live subscription to one bus channel. Dropping it unsubscribes.
pub struct BusSubscription {
    channel: String,
    messages: BoxStream<'static, Bytes>,
}

impl BusSubscription {
    /// Wrap a backend message stream.
    #[must_use]
    pub fn new(channel: impl Into<String>, messages: BoxStream<'static, Bytes>) -> Self {
        Self {
            channel: channel.into(),
            messages,
        }
    }

    /// Channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the subscription ends.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.messages.next().await
    }
}

/// Trait for the shared messaging substrate fanning stream messages out
/// across instances.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    /// Publish to a channel. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;
}

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier.
    pub subject: String,
    /// Provider-specific claims.
    #[serde(default)]
    pub claims: Value,
}

impl Identity {
    /// Identity without claims.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: Value::Null,
        }
    }
}

/// Authentication error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,
    #[error("Credential rejected: {0}")]
    Rejected(String),
}

/// Gate for session creation. Implemented by the embedding application.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// Verify a credential (for example a bearer token).
    async fn verify(&self, credential: Option<&str>) -> Result<Identity, AuthError>;
}
