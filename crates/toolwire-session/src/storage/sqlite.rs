//! SQLite session storage (feature-gated).
//!
//! Several processes on one host can share a database file; a write is
//! visible to every reader as soon as its statement commits.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use toolwire_core::{
    Metadata, SessionError, SessionId, SessionRecord, SessionStore, session::now_millis,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS toolwire_sessions (
    session_id   TEXT PRIMARY KEY NOT NULL,
    metadata     TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL
)";

/// SQLite storage implementation.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    idle_ttl: Option<Duration>,
}

fn backend(e: sqlx::Error) -> SessionError {
    SessionError::Backend(e.to_string())
}

impl SqliteSessionStore {
    /// Open (or create) the database and ensure the schema exists.
    ///
    /// # Errors
    /// Returns error if database connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, SessionError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true);
        // In-memory databases are per-connection; pin the pool to one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(backend)?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool.
    ///
    /// # Errors
    /// Returns error if the schema cannot be created.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, SessionError> {
        sqlx::query(SCHEMA).execute(&pool).await.map_err(backend)?;
        Ok(Self {
            pool,
            idle_ttl: None,
        })
    }

    /// Expire sessions idle for longer than `ttl`.
    #[must_use]
    pub fn with_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Oldest `last_seen_at` still considered live.
    fn live_cutoff(&self) -> i64 {
        self.idle_ttl.map_or(i64::MIN, |ttl| {
            now_millis().saturating_sub(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn set(&self, session_id: &str, metadata: Metadata) -> Result<(), SessionError> {
        let encoded = serde_json::to_string(&metadata)
            .map_err(|e| SessionError::Encoding(e.to_string()))?;
        let now = now_millis();
        sqlx::query(
            "INSERT INTO toolwire_sessions (session_id, metadata, created_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                 metadata = excluded.metadata,
                 created_at = CASE WHEN last_seen_at < ?4
                     THEN excluded.created_at ELSE created_at END,
                 last_seen_at = excluded.last_seen_at",
        )
        .bind(session_id)
        .bind(encoded)
        .bind(now)
        .bind(self.live_cutoff())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        let row = sqlx::query(
            "SELECT session_id, metadata, created_at, last_seen_at
             FROM toolwire_sessions WHERE session_id = ?1 AND last_seen_at >= ?2",
        )
        .bind(session_id)
        .bind(self.live_cutoff())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let metadata: String = row.try_get("metadata").map_err(backend)?;
        Ok(SessionRecord {
            session_id: row.try_get("session_id").map_err(backend)?,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| SessionError::Encoding(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(backend)?,
            last_seen_at: row.try_get("last_seen_at").map_err(backend)?,
        })
    }

    async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        sqlx::query("DELETE FROM toolwire_sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionId>, SessionError> {
        let rows = sqlx::query(
            "SELECT session_id FROM toolwire_sessions WHERE last_seen_at >= ?1 ORDER BY session_id",
        )
        .bind(self.live_cutoff())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|row| row.try_get("session_id").map_err(backend))
            .collect()
    }

    async fn touch(&self, session_id: &str) -> Result<(), SessionError> {
        let result = sqlx::query(
            "UPDATE toolwire_sessions SET last_seen_at = ?1
             WHERE session_id = ?2 AND last_seen_at >= ?3",
        )
        .bind(now_millis())
        .bind(session_id)
        .bind(self.live_cutoff())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<Vec<SessionId>, SessionError> {
        if self.idle_ttl.is_none() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "DELETE FROM toolwire_sessions WHERE last_seen_at < ?1 RETURNING session_id",
        )
        .bind(self.live_cutoff())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut ids: Vec<SessionId> = rows
            .iter()
            .map(|row| row.try_get("session_id").map_err(backend))
            .collect::<Result<_, _>>()?;
        ids.sort();
        Ok(ids)
    }
}
