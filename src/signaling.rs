//! Call-control signaling
//!
//! Signaling delivers [`SignalEnvelope`]s between exactly the two
//! participants of a call, addressed by user id, with at-least-once
//! semantics. The wire shape is fixed as
//! `{ "type", "callId", "from", "to", "data" }`.
//!
//! Per-user channels are scoped resources: opened when a user becomes
//! reachable for calling and guaranteed closed on every exit path,
//! including drop. Ordering between an offer/answer and the candidates
//! that follow it is not required here; the receiving side buffers
//! candidates that race ahead (see [`crate::negotiation`]).

use crate::identity::UserId;
use crate::types::{CallId, CallType, IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Outbound message could not be delivered
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// The local channel has been closed
    #[error("signaling channel closed")]
    ChannelClosed,

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Payload of a signaling message, discriminated by the wire `type` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Caller's offer; opens a call
    #[serde(rename_all = "camelCase")]
    CallOffer {
        /// The offer description
        description: SessionDescription,
        /// Audio or video
        call_type: CallType,
    },
    /// Callee's answer; activates the call
    CallAnswer {
        /// The answer description
        description: SessionDescription,
    },
    /// Trickled network path descriptor
    IceCandidate {
        /// The candidate
        candidate: IceCandidate,
    },
    /// Hang up; terminal for the call id
    CallEnd,
    /// Decline without answering; terminal for the call id
    CallDecline,
}

impl SignalPayload {
    /// Wire tag for this payload, used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnd => "call-end",
            Self::CallDecline => "call-decline",
        }
    }

    /// Whether receiving this payload terminates the call id
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CallEnd | Self::CallDecline)
    }
}

/// One signaling message, addressed to a single recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// The call this message belongs to
    pub call_id: CallId,
    /// Sender
    pub from: UserId,
    /// Recipient
    pub to: UserId,
    /// Discriminated payload
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Point-to-point message delivery between user channels.
///
/// Implement this for your delivery backend (a realtime datastore
/// channel, a websocket fan-out server, the in-process hub below).
/// Delivery must be at-least-once per message; duplicate arrivals are
/// handled by the session manager.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Open the per-user channel and return its inbound message stream.
    ///
    /// Re-opening an already open channel replaces the previous stream.
    ///
    /// # Errors
    ///
    /// Returns error if the channel cannot be established
    async fn open(&self, user: &UserId) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError>;

    /// Deliver an envelope to its recipient's channel
    ///
    /// # Errors
    ///
    /// Returns error if the recipient is unreachable
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;

    /// Tear down the per-user channel
    ///
    /// # Errors
    ///
    /// Returns error if teardown fails
    async fn close(&self, user: &UserId) -> Result<(), SignalingError>;
}

/// Interval base for linear send-retry backoff
const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// A user's open signaling channel: scoped resource wrapping a transport.
///
/// Closed exactly once, on [`SignalingChannel::close`] or on drop.
pub struct SignalingChannel<T: SignalingTransport> {
    user: UserId,
    transport: Arc<T>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<SignalEnvelope>>,
    closed: AtomicBool,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Open the channel for `user` on the given transport
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot establish the channel
    pub async fn open(transport: Arc<T>, user: UserId) -> Result<Self, SignalingError> {
        let inbound = transport.open(&user).await?;
        tracing::debug!(user = %user, "signaling channel opened");
        Ok(Self {
            user,
            transport,
            inbound: tokio::sync::Mutex::new(inbound),
            closed: AtomicBool::new(false),
        })
    }

    /// The user this channel belongs to
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Receive the next inbound envelope; `None` once the channel is closed
    pub async fn recv(&self) -> Option<SignalEnvelope> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.inbound.lock().await.recv().await
    }

    /// Send an envelope, retrying up to `retries` additional times with
    /// linear backoff before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::DeliveryFailed`] once retries are exhausted
    pub async fn send_with_retry(
        &self,
        envelope: SignalEnvelope,
        retries: u32,
    ) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::ChannelClosed);
        }
        let mut attempt = 0u32;
        loop {
            match self.transport.send(envelope.clone()).await {
                Ok(()) => {
                    tracing::debug!(
                        call_id = %envelope.call_id,
                        to = %envelope.to,
                        kind = envelope.payload.kind(),
                        "signal sent"
                    );
                    return Ok(());
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    let backoff = RETRY_BACKOFF_STEP * attempt;
                    tracing::warn!(
                        call_id = %envelope.call_id,
                        to = %envelope.to,
                        kind = envelope.payload.kind(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "send failed, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(e) => {
                    tracing::warn!(
                        call_id = %envelope.call_id,
                        to = %envelope.to,
                        kind = envelope.payload.kind(),
                        attempts = attempt + 1,
                        error = %e,
                        "send failed, retries exhausted"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Close the channel; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport.close(&self.user).await {
            tracing::warn!(user = %self.user, error = %e, "error closing signaling channel");
        } else {
            tracing::debug!(user = %self.user, "signaling channel closed");
        }
    }
}

impl<T: SignalingTransport> Drop for SignalingChannel<T> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let user = self.user.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = transport.close(&user).await;
            });
        }
    }
}

/// Mailbox depth per user channel
const HUB_CHANNEL_CAPACITY: usize = 64;

/// In-process signaling transport.
///
/// Routes envelopes between user channels living in the same process.
/// Backs same-process user sessions and the integration tests.
#[derive(Clone, Default)]
pub struct InProcessHub {
    routes: Arc<parking_lot::Mutex<HashMap<UserId, mpsc::Sender<SignalEnvelope>>>>,
}

impl InProcessHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a user currently has an open channel
    #[must_use]
    pub fn is_open(&self, user: &UserId) -> bool {
        self.routes.lock().contains_key(user)
    }
}

#[async_trait]
impl SignalingTransport for InProcessHub {
    async fn open(&self, user: &UserId) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError> {
        let (tx, rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
        self.routes.lock().insert(user.clone(), tx);
        Ok(rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let tx = self
            .routes
            .lock()
            .get(&envelope.to)
            .cloned()
            .ok_or_else(|| {
                SignalingError::DeliveryFailed(format!("peer unreachable: {}", envelope.to))
            })?;
        tx.send(envelope)
            .await
            .map_err(|_| SignalingError::DeliveryFailed("recipient channel closed".to_string()))
    }

    async fn close(&self, user: &UserId) -> Result<(), SignalingError> {
        self.routes.lock().remove(user);
        Ok(())
    }
}
