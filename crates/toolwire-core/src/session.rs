//! Session record and stream message types.

use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Session identifier. Globally unique across the cluster.
pub type SessionId = String;

/// Arbitrary per-session state.
pub type Metadata = HashMap<String, Value>;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Mint a fresh session identifier.
#[must_use]
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

/// Pub/sub channel carrying one session's stream.
#[must_use]
pub fn session_channel(session_id: &str) -> String {
    format!("toolwire:stream:{session_id}")
}

/// Metadata attached to a logical client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Unique session identifier.
    pub session_id: SessionId,
    /// Arbitrary metadata for request handlers.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation timestamp (Unix epoch millis).
    pub created_at: i64,
    /// Last activity timestamp (Unix epoch millis).
    pub last_seen_at: i64,
}

impl SessionRecord {
    /// Create a record with empty metadata.
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self::with_metadata(session_id, Metadata::new())
    }

    /// Create a record with metadata.
    #[must_use]
    pub fn with_metadata(session_id: impl Into<SessionId>, metadata: Metadata) -> Self {
        let now = now_millis();
        Self {
            session_id: session_id.into(),
            metadata,
            created_at: now,
            last_seen_at: now,
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_seen_at = now_millis();
    }

    /// Whether the session has been idle for longer than `ttl` at `now`.
    #[must_use]
    pub fn is_idle(&self, now: i64, ttl: Duration) -> bool {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(self.last_seen_at) > ttl_ms
    }
}

/// A server-originated message bound for one session's live consumer.
///
/// Transient: never persisted beyond delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub session_id: SessionId,
    pub payload: Value,
    pub published_at: i64,
}

impl StreamMessage {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>, payload: Value) -> Self {
        Self {
            session_id: session_id.into(),
            payload,
            published_at: now_millis(),
        }
    }
}
