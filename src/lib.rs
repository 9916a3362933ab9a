//! Peerline - one-to-one call session establishment
//!
//! This library manages the lifecycle of audio/video calls between
//! exactly two users: offer/answer negotiation, trickled ICE candidate
//! exchange, ring timeouts, and durable session records. It features:
//!
//! - **Single-owner state machine**: all call state lives in one actor,
//!   keyed by call id, with terminal ids latched against resurrection
//! - **Pluggable signaling**: any point-to-point delivery backend via
//!   the [`signaling::SignalingTransport`] trait
//! - **Pluggable media**: peer transports behind
//!   [`negotiation::PeerTransport`], with a real WebRTC implementation
//!   behind the `webrtc` feature and a deterministic loopback for tests
//! - **Pre-answer candidate buffering**: candidates that race ahead of
//!   the answer are held and applied in arrival order
//!
//! # Examples
//!
//! ```rust,no_run
//! use peerline::{CallServiceBuilder, CallType, InProcessHub, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = Arc::new(InProcessHub::new());
//!
//! let alice = CallServiceBuilder::new(UserId::new("alice"), hub.clone())
//!     .start()
//!     .await?;
//!
//! // Place a video call and hang up.
//! let call_id = alice.start_call(UserId::new("bob"), CallType::Video).await?;
//! alice.end_call(call_id).await?;
//!
//! alice.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call-session types and data structures
pub mod types;

/// User identity and directory lookup
pub mod identity;

/// Presence tracking
pub mod presence;

/// Durable call-session records
pub mod store;

/// Call-control signaling
pub mod signaling;

/// Media and transport negotiation
pub mod negotiation;

/// Peer transport backed by a real `RTCPeerConnection` (requires webrtc feature)
#[cfg(feature = "webrtc")]
pub mod webrtc_transport;

/// Call-session lifecycle management
pub mod manager;

/// Assembled calling service
pub mod service;

// Re-export main types at crate root
pub use identity::{MemoryDirectory, UserDirectory, UserId};
pub use manager::{CallError, CallManagerConfig, CallManagerHandle, CallSessionManager, ManagerDeps};
pub use negotiation::{
    LoopbackPeerTransport, MediaDevices, MediaStream, MediaTrack, NegotiationEngine,
    NegotiationError, PeerTransport, PeerTransportFactory, StaticMediaDevices, TrackKind,
    TransportEvent, TransportState,
};
pub use presence::{MemoryPresence, PresenceTracker};
pub use service::{CallService, CallServiceBuilder};
pub use signaling::{
    InProcessHub, SignalEnvelope, SignalPayload, SignalingChannel, SignalingError,
    SignalingTransport,
};
pub use store::{MemorySessionStore, SessionStore, StoreError};
pub use types::*;

#[cfg(feature = "webrtc")]
pub use webrtc_transport::{IceServerConfig, WebRtcPeerTransport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::{UserDirectory, UserId};
    pub use crate::manager::{CallError, CallManagerConfig, CallManagerHandle};
    pub use crate::negotiation::{MediaDevices, PeerTransport, PeerTransportFactory};
    pub use crate::presence::PresenceTracker;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{SignalEnvelope, SignalPayload, SignalingTransport};
    pub use crate::store::SessionStore;
    pub use crate::types::{
        CallEvent, CallId, CallSession, CallStatus, CallType, IceCandidate, SessionDescription,
    };
}
