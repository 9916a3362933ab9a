//! User identity and directory lookup
//!
//! Calls are addressed by opaque user identifiers handed to us by the
//! surrounding application. The directory trait exists only so that
//! incoming-call notifications can carry a human-readable caller name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};
use tokio::sync::RwLock;

/// Opaque user identifier.
///
/// The core never interprets the contents; equality and hashing are all
/// that matter for routing signaling messages and keying sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Friend/user directory lookup
///
/// Used only to resolve display names for notification payloads. A failed
/// or missing lookup must never block call progress; callers fall back to
/// the raw user id.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve the display name for a user, if known
    async fn display_name(&self, user: &UserId) -> Option<String>;
}

/// In-memory directory backed by a simple map
#[derive(Default)]
pub struct MemoryDirectory {
    names: RwLock<HashMap<UserId, String>>,
}

impl MemoryDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a display name
    pub async fn insert(&self, user: UserId, name: impl Into<String>) {
        self.names.write().await.insert(user, name.into());
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn display_name(&self, user: &UserId) -> Option<String> {
        self.names.read().await.get(user).cloned()
    }
}
