//! Session manager for auth-gated session lifecycle.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::task::JoinHandle;
use toolwire_core::{
    AuthError, AuthVerifier, Metadata, SessionError, SessionId, SessionRecord, SessionStore,
    session::{new_session_id, now_millis},
};

use crate::{
    config::SessionConfig,
    stream::{DeliveryError, PublishReceipt, SessionStream, StreamManager},
};

/// Metadata key holding the verified identity.
pub const IDENTITY_KEY: &str = "identity";

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Ties the session store, the stream manager and the credential verifier
/// together.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    streams: Arc<StreamManager>,
    verifier: Arc<dyn AuthVerifier>,
    config: SessionConfig,
}

impl SessionManager {
    /// Create a new session manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        streams: Arc<StreamManager>,
        verifier: Arc<dyn AuthVerifier>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            streams,
            verifier,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Verify a credential and open a new session.
    ///
    /// # Errors
    /// Returns error if the verifier rejects the credential or the store
    /// write fails.
    pub async fn open(&self, credential: Option<&str>) -> Result<SessionRecord, ManagerError> {
        let identity = self.verifier.verify(credential).await?;
        let session_id = new_session_id();

        let mut metadata = Metadata::new();
        metadata.insert(
            IDENTITY_KEY.to_string(),
            serde_json::to_value(&identity)
                .map_err(|e| SessionError::Encoding(e.to_string()))?,
        );
        self.store.set(&session_id, metadata).await?;

        tracing::info!(session_id = %session_id, subject = %identity.subject, "session opened");
        Ok(self.store.get(&session_id).await?)
    }

    /// Resume an existing session, bumping its activity timestamp.
    ///
    /// # Errors
    /// Returns `SessionError::NotFound` if the session is unknown or expired.
    pub async fn resume(&self, session_id: &str) -> Result<SessionRecord, ManagerError> {
        self.live(session_id).await?;
        self.store.touch(session_id).await?;
        tracing::debug!(session_id, "session resumed");
        Ok(self.store.get(session_id).await?)
    }

    /// Get a session without touching it.
    ///
    /// # Errors
    /// Returns `SessionError::NotFound` if the session is unknown or expired.
    pub async fn get(&self, session_id: &str) -> Result<SessionRecord, ManagerError> {
        self.live(session_id).await
    }

    /// Fetch a record, dropping it if it has been idle past `idle_ttl`.
    async fn live(&self, session_id: &str) -> Result<SessionRecord, ManagerError> {
        let record = self.store.get(session_id).await?;
        if self.is_idle(&record, now_millis()) {
            self.expire(session_id).await?;
            return Err(SessionError::NotFound(session_id.to_string()).into());
        }
        Ok(record)
    }

    fn is_idle(&self, record: &SessionRecord, now: i64) -> bool {
        self.config
            .idle_ttl()
            .is_some_and(|ttl| record.is_idle(now, ttl))
    }

    async fn expire(&self, session_id: &str) -> Result<(), ManagerError> {
        self.streams.close_stream(session_id);
        self.store.delete(session_id).await?;
        tracing::debug!(session_id, "idle session expired");
        Ok(())
    }

    /// Set one metadata key, keeping the others.
    ///
    /// Concurrent updates to the same session are last-writer-wins.
    ///
    /// # Errors
    /// Returns error if the session is missing or the store write fails.
    pub async fn update_metadata(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> Result<SessionRecord, ManagerError> {
        let mut record = self.live(session_id).await?;
        record.set_metadata(key, value);
        self.store.set(session_id, record.metadata).await?;
        Ok(self.store.get(session_id).await?)
    }

    /// Take ownership of the session's stream on this instance.
    ///
    /// # Errors
    /// Returns error if the session is missing or the bus subscription fails.
    pub async fn attach_stream(&self, session_id: &str) -> Result<SessionStream, ManagerError> {
        self.live(session_id).await?;
        Ok(self.streams.create_stream(session_id).await?)
    }

    /// Publish a message to the session's live consumer, wherever it is.
    ///
    /// # Errors
    /// Returns `DeliveryError` per the stream delivery policy.
    pub async fn publish(
        &self,
        session_id: &str,
        payload: Value,
    ) -> Result<PublishReceipt, ManagerError> {
        Ok(self.streams.publish(session_id, payload).await?)
    }

    /// Close a session: drop its record and its local stream.
    ///
    /// # Errors
    /// Returns error if the store delete fails.
    pub async fn close(&self, session_id: &str) -> Result<(), ManagerError> {
        self.streams.close_stream(session_id);
        self.store.delete(session_id).await?;
        tracing::info!(session_id, "session closed");
        Ok(())
    }

    /// Purge sessions idle past `idle_ttl` and close their local streams.
    ///
    /// Records the store itself considers expired are purged as well.
    ///
    /// # Errors
    /// Returns error if a store read or delete fails.
    pub async fn sweep_expired(&self) -> Result<Vec<SessionId>, ManagerError> {
        let mut expired = self.store.purge_expired().await?;
        for session_id in &expired {
            self.streams.close_stream(session_id);
        }
        if self.config.idle_ttl().is_some() {
            let now = now_millis();
            for session_id in self.store.list().await? {
                let record = match self.store.get(&session_id).await {
                    Ok(record) => record,
                    Err(SessionError::NotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                if self.is_idle(&record, now) {
                    self.expire(&session_id).await?;
                    expired.push(session_id);
                }
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions purged");
        }
        Ok(expired)
    }

    /// Run [`Self::sweep_expired`] every `sweep_interval` until aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.sweep_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_expired().await {
                    tracing::error!(error = %e, "session sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::assert_err;
    use toolwire_core::Identity;

    use super::*;
    use crate::{
        StreamConfig, auth::StaticTokenVerifier, bus::MemoryBus, storage::MemorySessionStore,
    };

    fn manager(ttl_ms: Option<u64>) -> SessionManager {
        let bus = Arc::new(MemoryBus::new());
        SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(StreamManager::new(bus, StreamConfig::default())),
            Arc::new(StaticTokenVerifier::new().with_token("t", Identity::new("alice"))),
            SessionConfig {
                idle_ttl_ms: ttl_ms,
                sweep_interval_ms: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_open_stores_identity() {
        let manager = manager(None);
        let record = manager.open(Some("t")).await.unwrap();
        assert_eq!(
            record.get_metadata(IDENTITY_KEY).unwrap()["subject"],
            json!("alice")
        );

        let resumed = manager.resume(&record.session_id).await.unwrap();
        assert_eq!(resumed.session_id, record.session_id);
        assert!(resumed.last_seen_at >= record.last_seen_at);
    }

    #[tokio::test]
    async fn test_open_rejects_bad_credential() {
        let manager = manager(None);
        assert!(matches!(
            manager.open(Some("wrong")).await,
            Err(ManagerError::Auth(AuthError::Rejected(_)))
        ));
        assert!(matches!(
            manager.open(None).await,
            Err(ManagerError::Auth(AuthError::Missing))
        ));
    }

    #[tokio::test]
    async fn test_resume_unknown_session_fails() {
        let manager = manager(None);
        assert!(matches!(
            manager.resume("ghost").await,
            Err(ManagerError::Session(SessionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_update_metadata_merges_one_key() {
        let manager = manager(None);
        let record = manager.open(Some("t")).await.unwrap();
        let updated = manager
            .update_metadata(&record.session_id, "caps", json!({"tools": true}))
            .await
            .unwrap();
        assert!(updated.get_metadata(IDENTITY_KEY).is_some());
        assert_eq!(updated.get_metadata("caps"), Some(&json!({"tools": true})));
    }

    #[tokio::test]
    async fn test_close_drops_record_and_stream() {
        let manager = manager(None);
        let record = manager.open(Some("t")).await.unwrap();
        let stream = manager.attach_stream(&record.session_id).await.unwrap();

        manager.close(&record.session_id).await.unwrap();
        assert!(stream.recv().await.is_none());
        assert_err!(manager.get(&record.session_id).await);
        assert!(!manager.streams().has_stream(&record.session_id));
    }

    #[tokio::test]
    async fn test_attach_requires_existing_session() {
        let manager = manager(None);
        assert!(matches!(
            manager.attach_stream("ghost").await,
            Err(ManagerError::Session(SessionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_sweeper_purges_idle_sessions() {
        let manager = Arc::new(manager(Some(20)));
        let record = manager.open(Some("t")).await.unwrap();
        let stream = manager.attach_stream(&record.session_id).await.unwrap();
        let sweeper = Arc::clone(&manager).spawn_sweeper();

        let ended = tokio::time::timeout(Duration::from_secs(2), stream.recv())
            .await
            .unwrap();
        assert!(ended.is_none());
        assert!(manager.store().list().await.unwrap().is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_configured_ttl_expires_idle_session() {
        let manager = manager(Some(20));
        let record = manager.open(Some("t")).await.unwrap();
        let stream = manager.attach_stream(&record.session_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(
            manager.resume(&record.session_id).await,
            Err(ManagerError::Session(SessionError::NotFound(_)))
        ));
        assert!(stream.recv().await.is_none());
        assert!(manager.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_uses_configured_ttl() {
        let manager = manager(Some(20));
        let idle = manager.open(Some("t")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = manager.open(Some("t")).await.unwrap();

        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, vec![idle.session_id.clone()]);
        assert!(manager.get(&fresh.session_id).await.is_ok());
        assert_eq!(manager.store().list().await.unwrap(), vec![fresh.session_id]);
    }

    #[tokio::test]
    async fn test_no_ttl_keeps_sessions() {
        let manager = manager(None);
        let record = manager.open(Some("t")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(manager.sweep_expired().await.unwrap().is_empty());
        assert!(manager.resume(&record.session_id).await.is_ok());
    }
}
