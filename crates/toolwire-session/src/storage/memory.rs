//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock, time::Duration};

use async_trait::async_trait;
use toolwire_core::{
    Metadata, SessionError, SessionId, SessionRecord, SessionStore, session::now_millis,
};

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments. Not shared
/// between processes; data is lost on restart.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
    idle_ttl: Option<Duration>,
}

impl MemorySessionStore {
    /// Create a store without idle expiry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl: None,
        }
    }

    /// Expire sessions idle for longer than `ttl`.
    #[must_use]
    pub fn with_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_ttl = ttl;
        self
    }

    fn expired(&self, record: &SessionRecord, now: i64) -> bool {
        self.idle_ttl.is_some_and(|ttl| record.is_idle(now, ttl))
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> SessionError {
    SessionError::Backend(e.to_string())
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, session_id: &str, metadata: Metadata) -> Result<(), SessionError> {
        let now = now_millis();
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        match sessions.get_mut(session_id) {
            Some(record) if !self.expired(record, now) => {
                record.metadata = metadata;
                record.touch();
            }
            _ => {
                sessions.insert(
                    session_id.to_string(),
                    SessionRecord::with_metadata(session_id, metadata),
                );
            }
        }
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        sessions
            .get(session_id)
            .filter(|record| !self.expired(record, now_millis()))
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        self.sessions.write().map_err(poisoned)?.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionId>, SessionError> {
        let now = now_millis();
        let sessions = self.sessions.read().map_err(poisoned)?;
        let mut ids: Vec<SessionId> = sessions
            .values()
            .filter(|record| !self.expired(record, now))
            .map(|record| record.session_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn touch(&self, session_id: &str) -> Result<(), SessionError> {
        let now = now_millis();
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let expired = sessions
            .get(session_id)
            .is_some_and(|record| self.expired(record, now));
        if expired {
            sessions.remove(session_id);
        }
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        record.touch();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<Vec<SessionId>, SessionError> {
        let now = now_millis();
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|record| self.expired(record, now))
            .map(|record| record.session_id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired)
    }
}
