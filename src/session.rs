//! Server-side session registry
//!
//! A session is created when a client completes `initialize` and is
//! identified by an opaque token. Every later message carrying that token
//! refreshes `last_activity`; sessions idle for longer than a maximum age are
//! removed by [`SessionRegistry::sweep`].
//!
//! State lives in memory only and does not survive a restart.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::protocol::Implementation;

/// Default maximum number of sessions
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// One negotiated client connection
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub client_info: Implementation,
    pub protocol_version: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl SessionInfo {
    /// Idle time as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }
}

/// Shared, concurrency-safe map of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    max_sessions: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// Cap the number of live sessions. `create` fails once it is reached.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Register a new session and return its id.
    pub async fn create(
        &self,
        client_info: Implementation,
        protocol_version: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_sessions {
            tracing::warn!(
                max = self.max_sessions,
                current = sessions.len(),
                "Session limit reached, rejecting new session"
            );
            return Err(Error::Internal("Session limit reached".to_string()));
        }

        let now = Utc::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let info = SessionInfo {
            session_id: session_id.clone(),
            client_info,
            protocol_version: protocol_version.into(),
            created_at: now,
            last_activity: now,
            metadata,
        };
        tracing::debug!(
            session_id = %session_id,
            client = %info.client_info.name,
            version = %info.protocol_version,
            total = sessions.len() + 1,
            "Created new session"
        );
        sessions.insert(session_id.clone(), info);
        Ok(session_id)
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Refresh `last_activity`. Returns whether the session exists.
    pub async fn touch(&self, id: &str) -> bool {
        self.touch_at(id, Utc::now()).await
    }

    /// Set `last_activity` to an explicit instant.
    pub async fn touch_at(&self, id: &str, at: DateTime<Utc>) -> bool {
        match self.sessions.write().await.get_mut(id) {
            Some(session) => {
                session.last_activity = at;
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, total = sessions.len(), "Removed session");
        }
        removed
    }

    /// Snapshot of every live session.
    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove sessions idle for longer than `max_age`. Returns how many went.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        self.sweep_at(Utc::now(), max_age).await
    }

    /// [`sweep`](Self::sweep) relative to an explicit `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let expired = session.idle_for(now) > max_age;
            if expired {
                tracing::debug!(session_id = %id, "Removing expired session");
            }
            !expired
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = sessions.len(),
                "Cleaned up expired sessions"
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Implementation {
        Implementation::new("test-client", "1.0.0")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new();
        let mut metadata = Map::new();
        metadata.insert("transport".to_string(), Value::from("http"));

        let id = registry
            .create(client(), "2025-06-18", metadata)
            .await
            .unwrap();
        let info = registry.get(&id).await.unwrap();

        assert_eq!(info.session_id, id);
        assert_eq!(info.protocol_version, "2025-06-18");
        assert_eq!(info.created_at, info.last_activity);
        assert_eq!(info.metadata["transport"], "http");
        assert!(registry.get("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.create(client(), "2025-06-18", Map::new()).await.unwrap();
        let b = registry.create(client(), "2025-06-18", Map::new()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_touch_and_delete() {
        let registry = SessionRegistry::new();
        let id = registry.create(client(), "2025-03-26", Map::new()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert!(registry.touch_at(&id, later).await);
        assert_eq!(registry.get(&id).await.unwrap().last_activity, later);
        assert!(!registry.touch("missing").await);

        assert!(registry.delete(&id).await);
        assert!(!registry.delete(&id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let registry = SessionRegistry::new();
        let id = registry.create(client(), "2025-06-18", Map::new()).await.unwrap();

        let snapshot = registry.list().await;
        registry.delete(&id).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id, id);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_idle_sessions() {
        let registry = SessionRegistry::new();
        let max_age = Duration::from_secs(60);

        let s1 = registry.create(client(), "2025-06-18", Map::new()).await.unwrap();
        let s2 = registry.create(client(), "2025-06-18", Map::new()).await.unwrap();
        let s3 = registry.create(client(), "2025-06-18", Map::new()).await.unwrap();

        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(120);
        registry.touch_at(&s1, stale).await;
        registry.touch_at(&s3, stale).await;

        let removed = registry.sweep_at(now, max_age).await;
        assert_eq!(removed, 2);
        assert!(registry.get(&s2).await.is_some());
        assert!(registry.get(&s1).await.is_none());
        assert!(registry.get(&s3).await.is_none());
    }

    #[tokio::test]
    async fn test_max_sessions_limit() {
        let registry = SessionRegistry::new().with_max_sessions(2);

        let s1 = registry.create(client(), "2025-06-18", Map::new()).await.unwrap();
        registry.create(client(), "2025-06-18", Map::new()).await.unwrap();
        assert!(registry.create(client(), "2025-06-18", Map::new()).await.is_err());

        registry.delete(&s1).await;
        assert!(registry.create(client(), "2025-06-18", Map::new()).await.is_ok());
    }
}
