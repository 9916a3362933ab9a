//! Core call-session types and data structures

use crate::identity::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio-only call
    Audio,
    /// Audio + video call
    Video,
}

impl CallType {
    /// Whether this call carries video
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Persisted status of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Offer sent or received, waiting on the callee
    Ringing,
    /// Both descriptions applied, media flowing
    Active,
    /// Callee declined
    Declined,
    /// Either side hung up (or the caller cancelled)
    Ended,
    /// Setup failed before the call became active
    Failed,
}

impl CallStatus {
    /// Whether this status is terminal; a terminal session is immutable history
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Declined | Self::Ended | Self::Failed)
    }
}

/// Durable record of one call attempt between exactly two users.
///
/// Created the instant a call is requested (or an offer arrives) and
/// mutated only through [`crate::manager::CallSessionManager`] transitions.
/// Once the status is terminal the record never changes again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Unique identifier, immutable
    pub id: CallId,
    /// Audio or video, fixed at creation
    pub call_type: CallType,
    /// Opaque transport-routing token, fixed at creation
    pub room_id: String,
    /// The user who placed the call
    pub initiator_id: UserId,
    /// Exactly two participants, initiator first
    pub participant_ids: [UserId; 2],
    /// Current lifecycle status
    pub status: CallStatus,
    /// When the call became active, if it ever did
    pub started_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Refreshed on every status transition
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    /// Create a new ringing session initiated by `initiator` towards `callee`
    #[must_use]
    pub fn new(id: CallId, call_type: CallType, initiator: UserId, callee: UserId) -> Self {
        let now = Utc::now();
        Self {
            id,
            call_type,
            room_id: Uuid::new_v4().to_string(),
            initiator_id: initiator.clone(),
            participant_ids: [initiator, callee],
            status: CallStatus::Ringing,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status transition, refreshing `updated_at`.
    ///
    /// Marks `started_at` the first time the session becomes active.
    pub fn touch(&mut self, status: CallStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status == CallStatus::Active && self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
    }

    /// The participant that is not `user`, if `user` is part of this call
    #[must_use]
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        let [a, b] = &self.participant_ids;
        if a == user {
            Some(b)
        } else if b == user {
            Some(a)
        } else {
            None
        }
    }

    /// How long the call has been (or was) active
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        if self.status.is_terminal() {
            Some(self.updated_at - start)
        } else {
            Some(Utc::now() - start)
        }
    }
}

/// Which side of the offer/answer exchange a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Caller's proposed media configuration
    Offer,
    /// Callee's accepted media configuration
    Answer,
}

/// Opaque session description produced by the peer transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Transport-defined payload
    pub sdp: String,
}

/// Network path descriptor exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media id
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

/// Event surfaced to the presentation layer
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An unseen call-offer arrived; prompt the user to accept or decline
    IncomingCall {
        /// The ringing session
        session: CallSession,
        /// Who is calling
        caller_id: UserId,
        /// Display name resolved from the directory (falls back to the id)
        caller_name: String,
        /// The caller's offer
        offer: SessionDescription,
    },
    /// A call changed status; fired on every manager transition
    StateChanged {
        /// Which call
        call_id: CallId,
        /// Its new status
        status: CallStatus,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_uniqueness() {
        assert_ne!(CallId::new(), CallId::new());
    }

    #[test]
    fn test_call_type_video() {
        assert!(!CallType::Audio.has_video());
        assert!(CallType::Video.has_video());
    }

    #[test]
    fn test_status_terminality() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Active.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
    }

    #[test]
    fn test_session_transitions() {
        let mut session = CallSession::new(
            CallId::new(),
            CallType::Audio,
            UserId::new("alice"),
            UserId::new("bob"),
        );
        assert_eq!(session.status, CallStatus::Ringing);
        assert!(session.started_at.is_none());

        session.touch(CallStatus::Active);
        assert!(session.started_at.is_some());
        let started = session.started_at;

        session.touch(CallStatus::Ended);
        assert_eq!(session.started_at, started);
        assert!(session.status.is_terminal());
        assert!(session.duration().is_some());
    }

    #[test]
    fn test_peer_of() {
        let session = CallSession::new(
            CallId::new(),
            CallType::Video,
            UserId::new("alice"),
            UserId::new("bob"),
        );
        assert_eq!(
            session.peer_of(&UserId::new("alice")),
            Some(&UserId::new("bob"))
        );
        assert_eq!(
            session.peer_of(&UserId::new("bob")),
            Some(&UserId::new("alice"))
        );
        assert_eq!(session.peer_of(&UserId::new("mallory")), None);
    }

    #[test]
    fn test_room_ids_are_distinct() {
        let a = CallSession::new(
            CallId::new(),
            CallType::Audio,
            UserId::new("alice"),
            UserId::new("bob"),
        );
        let b = CallSession::new(
            CallId::new(),
            CallType::Audio,
            UserId::new("alice"),
            UserId::new("bob"),
        );
        assert_ne!(a.room_id, b.room_id);
    }
}
