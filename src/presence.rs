//! Presence tracking
//!
//! Presence is an advisory hint only: the core reads it to annotate logs
//! and notifications, never to gate a call attempt. The signaling attempt
//! itself is the authoritative reachability test.

use crate::identity::UserId;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Read-only view of user reachability
#[async_trait]
pub trait PresenceTracker: Send + Sync {
    /// Whether the user is currently reported online
    async fn is_online(&self, user: &UserId) -> bool;
}

/// In-memory presence set
#[derive(Default)]
pub struct MemoryPresence {
    online: RwLock<HashSet<UserId>>,
}

impl MemoryPresence {
    /// Create an empty presence tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a user online
    pub async fn set_online(&self, user: UserId) {
        self.online.write().await.insert(user);
    }

    /// Mark a user offline
    pub async fn set_offline(&self, user: &UserId) {
        self.online.write().await.remove(user);
    }
}

#[async_trait]
impl PresenceTracker for MemoryPresence {
    async fn is_online(&self, user: &UserId) -> bool {
        self.online.read().await.contains(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_presence_flags() {
        let presence = MemoryPresence::new();
        let alice = UserId::new("alice");

        assert!(!presence.is_online(&alice).await);
        presence.set_online(alice.clone()).await;
        assert!(presence.is_online(&alice).await);
        presence.set_offline(&alice).await;
        assert!(!presence.is_online(&alice).await);
    }
}
