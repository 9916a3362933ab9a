//! Durable call-session records
//!
//! The store is an external collaborator: it persists [`CallSession`]
//! records for history views. A store outage must never block in-memory
//! call progress, so the manager treats every error from here as a
//! logged warning rather than a call failure.

use crate::types::{CallId, CallSession};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Session store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record for the given call id
    #[error("session not found: {0}")]
    NotFound(CallId),

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable record of call sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a newly created session
    async fn create(&self, session: &CallSession) -> Result<(), StoreError>;

    /// Persist an updated session (status/timestamps changed)
    async fn update(&self, session: &CallSession) -> Result<(), StoreError>;

    /// Fetch a session by id
    async fn get(&self, call_id: CallId) -> Result<CallSession, StoreError>;
}

/// In-memory session store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<CallId, CallSession>>,
}

impl MemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &CallSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn update(&self, session: &CallSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(session.id)),
        }
    }

    async fn get(&self, call_id: CallId) -> Result<CallSession, StoreError> {
        self.sessions
            .read()
            .await
            .get(&call_id)
            .cloned()
            .ok_or(StoreError::NotFound(call_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use crate::types::{CallStatus, CallType};

    fn session() -> CallSession {
        CallSession::new(
            CallId::new(),
            CallType::Audio,
            UserId::new("alice"),
            UserId::new("bob"),
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemorySessionStore::new();
        let s = session();
        store.create(&s).await.unwrap();

        let loaded = store.get(s.id).await.unwrap();
        assert_eq!(loaded.id, s.id);
        assert_eq!(loaded.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_update_transitions() {
        let store = MemorySessionStore::new();
        let mut s = session();
        store.create(&s).await.unwrap();

        s.touch(CallStatus::Active);
        store.update(&s).await.unwrap();
        assert_eq!(store.get(s.id).await.unwrap().status, CallStatus::Active);

        s.touch(CallStatus::Ended);
        store.update(&s).await.unwrap();
        assert_eq!(store.get(s.id).await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_update_unknown_is_error() {
        let store = MemorySessionStore::new();
        let s = session();
        assert!(matches!(
            store.update(&s).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
