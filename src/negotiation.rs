//! Media and transport negotiation
//!
//! [`NegotiationEngine`] wraps local media capture and the peer-transport
//! negotiation primitives (offer/answer, candidate exchange, track
//! lifecycle) for exactly one call at a time. The engine owns two
//! behaviors the rest of the crate depends on:
//!
//! - ICE candidates routinely race ahead of the answer/offer they belong
//!   to. Candidates received before the remote description is applied are
//!   held in an ordered buffer and flushed, in arrival order, immediately
//!   after [`NegotiationEngine::apply_remote_description`] completes.
//! - Inbound audio tracks can arrive in a disabled state (platform
//!   behavior, not a design choice). The engine force-enables them before
//!   handing the stream to the `on_remote_stream` subscriber. This is a
//!   required correction, keep it.

use crate::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

/// Negotiation and media errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// No capture device for the requested media kind
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The runtime environment refused media access
    #[error("media permission denied")]
    PermissionDenied,

    /// Operation invoked out of the allowed sequence
    #[error("invalid negotiation state: {0}")]
    InvalidState(&'static str),

    /// Peer transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// One media track within a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Whether the track is live; disabled tracks produce no media
    pub enabled: bool,
}

impl MediaTrack {
    /// Create an enabled track of the given kind
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self {
            id: format!("{prefix}-{}", Uuid::new_v4()),
            kind,
            enabled: true,
        }
    }
}

/// A bundle of media tracks, local or remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    /// Stream identifier
    pub id: String,
    /// Tracks in this stream
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create a stream with the given tracks
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Whether any track of the given kind is present
    #[must_use]
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Connection state reported by a peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not yet negotiating
    New,
    /// Negotiation in progress
    Connecting,
    /// Media path established
    Connected,
    /// Peer unreachable
    Disconnected,
    /// Negotiation failed
    Failed,
    /// Transport closed
    Closed,
}

/// Event emitted by a peer transport as negotiation progresses
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local network path descriptor was discovered; forward it to the peer
    LocalCandidate(IceCandidate),
    /// The remote side's media arrived
    RemoteStream(MediaStream),
    /// The connection state changed
    StateChanged(TransportState),
}

/// Local media capture.
///
/// The single seam through which the engine reaches camera/microphone
/// devices; swapping implementations is how headless sessions and tests
/// run without hardware.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a local capture stream with the requested kinds
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::DeviceUnavailable`] if a requested device
    /// is missing and [`NegotiationError::PermissionDenied`] if the runtime
    /// environment refuses access
    async fn acquire(&self, audio: bool, video: bool) -> Result<MediaStream, NegotiationError>;
}

/// Peer-transport negotiation primitives.
///
/// Implemented over a real `RTCPeerConnection` by
/// [`crate::webrtc_transport::WebRtcPeerTransport`] and by the in-process
/// [`LoopbackPeerTransport`] below.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce an offer description
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot produce an offer
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Produce an answer description; requires a remote offer applied first
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot produce an answer
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Install our own description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Install the peer's description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Add a remote network path descriptor
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Attach local capture tracks before negotiating
    ///
    /// # Errors
    ///
    /// Returns error if the tracks cannot be attached
    async fn attach_local_media(&self, stream: &MediaStream) -> Result<(), NegotiationError>;

    /// Subscribe to transport events
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Close the transport and release its resources
    ///
    /// # Errors
    ///
    /// Returns error if close fails; the handle is unusable afterwards either way
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Pending peer transport produced by a factory
pub type PeerTransportFuture =
    BoxFuture<'static, Result<Arc<dyn PeerTransport>, NegotiationError>>;

/// Factory producing one fresh peer transport per call
pub type PeerTransportFactory = Arc<dyn Fn() -> PeerTransportFuture + Send + Sync>;

#[derive(Default)]
struct EngineState {
    local: Option<MediaStream>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    torn_down: bool,
}

struct EngineInner {
    transport: Arc<dyn PeerTransport>,
    devices: Arc<dyn MediaDevices>,
    state: RwLock<EngineState>,
    candidate_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<IceCandidate>>>,
    stream_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<MediaStream>>>,
    pump: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Per-call negotiation engine; cheap to clone, all clones share state
#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

impl NegotiationEngine {
    /// Create an engine over the given transport and capture devices
    #[must_use]
    pub fn new(transport: Arc<dyn PeerTransport>, devices: Arc<dyn MediaDevices>) -> Self {
        let inner = Arc::new(EngineInner {
            transport,
            devices,
            state: RwLock::new(EngineState::default()),
            candidate_tx: parking_lot::Mutex::new(None),
            stream_tx: parking_lot::Mutex::new(None),
            pump: parking_lot::Mutex::new(None),
        });

        let pump_inner = Arc::clone(&inner);
        let mut events = pump_inner.transport.subscribe_events();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::LocalCandidate(candidate)) => {
                        if let Some(tx) = pump_inner.candidate_tx.lock().as_ref() {
                            let _ = tx.send(candidate);
                        }
                    }
                    Ok(TransportEvent::RemoteStream(mut stream)) => {
                        // Inbound audio tracks can arrive disabled; enable them
                        // before anyone sees the stream.
                        for track in &mut stream.tracks {
                            if track.kind == TrackKind::Audio && !track.enabled {
                                tracing::debug!(track_id = %track.id, "force-enabling remote audio track");
                                track.enabled = true;
                            }
                        }
                        if let Some(tx) = pump_inner.stream_tx.lock().as_ref() {
                            let _ = tx.send(stream);
                        }
                    }
                    Ok(TransportEvent::StateChanged(state)) => {
                        tracing::debug!(state = ?state, "peer transport state changed");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "negotiation event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *inner.pump.lock() = Some(handle);

        Self { inner }
    }

    /// Register the sink for locally discovered ICE candidates
    pub fn on_local_ice_candidate(&self, sink: mpsc::UnboundedSender<IceCandidate>) {
        *self.inner.candidate_tx.lock() = Some(sink);
    }

    /// Register the sink for the remote media stream
    pub fn on_remote_stream(&self, sink: mpsc::UnboundedSender<MediaStream>) {
        *self.inner.stream_tx.lock() = Some(sink);
    }

    /// Acquire local capture media and attach it to the transport
    ///
    /// # Errors
    ///
    /// Returns capture errors from the device layer, or
    /// [`NegotiationError::InvalidState`] if media was already acquired or
    /// the engine is torn down
    pub async fn acquire_local_media(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<MediaStream, NegotiationError> {
        let mut state = self.inner.state.write().await;
        if state.torn_down {
            return Err(NegotiationError::InvalidState("engine torn down"));
        }
        if state.local.is_some() {
            return Err(NegotiationError::InvalidState("local media already acquired"));
        }
        let stream = self.inner.devices.acquire(audio, video).await?;
        self.inner.transport.attach_local_media(&stream).await?;
        tracing::debug!(
            stream_id = %stream.id,
            audio = stream.has_kind(TrackKind::Audio),
            video = stream.has_kind(TrackKind::Video),
            "local media attached"
        );
        state.local = Some(stream.clone());
        Ok(stream)
    }

    /// Create and install the local offer; requires local media attached
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::InvalidState`] when called out of order
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.inner.state.read().await;
        if state.torn_down {
            return Err(NegotiationError::InvalidState("engine torn down"));
        }
        if state.local.is_none() {
            return Err(NegotiationError::InvalidState("local media not attached"));
        }
        drop(state);

        let offer = self.inner.transport.create_offer().await?;
        self.inner
            .transport
            .set_local_description(offer.clone())
            .await?;
        Ok(offer)
    }

    /// Create and install the local answer; requires local media and an
    /// applied remote offer
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::InvalidState`] when called out of order
    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.inner.state.read().await;
        if state.torn_down {
            return Err(NegotiationError::InvalidState("engine torn down"));
        }
        if state.local.is_none() {
            return Err(NegotiationError::InvalidState("local media not attached"));
        }
        if !state.remote_applied {
            return Err(NegotiationError::InvalidState(
                "remote description not applied",
            ));
        }
        drop(state);

        let answer = self.inner.transport.create_answer().await?;
        self.inner
            .transport
            .set_local_description(answer.clone())
            .await?;
        Ok(answer)
    }

    /// Apply the peer's description, then flush any candidates that were
    /// buffered while it was in flight, in their original arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::InvalidState`] on a second invocation
    pub async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = self.inner.state.write().await;
        if state.torn_down {
            return Err(NegotiationError::InvalidState("engine torn down"));
        }
        if state.remote_applied {
            return Err(NegotiationError::InvalidState(
                "remote description already applied",
            ));
        }

        self.inner
            .transport
            .set_remote_description(description)
            .await?;
        state.remote_applied = true;

        let buffered = std::mem::take(&mut state.pending_candidates);
        let flushed = buffered.len();
        for candidate in buffered {
            self.inner.transport.add_ice_candidate(candidate).await?;
        }
        if flushed > 0 {
            tracing::debug!(flushed, "buffered remote candidates applied");
        }
        Ok(())
    }

    /// Add a remote candidate; buffered if the remote description has not
    /// been applied yet, forwarded to the transport otherwise.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the candidate
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let mut state = self.inner.state.write().await;
        if state.torn_down {
            tracing::debug!("candidate ignored after teardown");
            return Ok(());
        }
        if state.remote_applied {
            self.inner.transport.add_ice_candidate(candidate).await
        } else {
            state.pending_candidates.push(candidate);
            tracing::trace!(
                buffered = state.pending_candidates.len(),
                "candidate buffered ahead of remote description"
            );
            Ok(())
        }
    }

    /// Release local media tracks and the transport handle.
    ///
    /// Idempotent: only the first call does any work.
    pub async fn teardown(&self) {
        {
            let mut state = self.inner.state.write().await;
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            if let Some(mut stream) = state.local.take() {
                for track in &mut stream.tracks {
                    track.enabled = false;
                }
                tracing::debug!(stream_id = %stream.id, "local media released");
            }
            state.pending_candidates.clear();
        }

        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!(error = %e, "error closing peer transport");
        }
    }
}

/// Default capture device layer: a fixed description of what hardware
/// exists and whether access is granted. Real capture is wired in by the
/// embedding application; the core only needs the acquisition contract.
#[derive(Debug, Clone)]
pub struct StaticMediaDevices {
    /// An audio input device exists
    pub audio_available: bool,
    /// A video input device exists
    pub video_available: bool,
    /// The runtime environment grants capture access
    pub permission_granted: bool,
}

impl Default for StaticMediaDevices {
    fn default() -> Self {
        Self {
            audio_available: true,
            video_available: true,
            permission_granted: true,
        }
    }
}

impl StaticMediaDevices {
    /// Devices present and permission granted
    #[must_use]
    pub fn granted() -> Self {
        Self::default()
    }

    /// No capture devices at all
    #[must_use]
    pub fn without_devices() -> Self {
        Self {
            audio_available: false,
            video_available: false,
            permission_granted: true,
        }
    }

    /// Devices present but access refused
    #[must_use]
    pub fn denied() -> Self {
        Self {
            permission_granted: false,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaDevices for StaticMediaDevices {
    async fn acquire(&self, audio: bool, video: bool) -> Result<MediaStream, NegotiationError> {
        if !self.permission_granted {
            return Err(NegotiationError::PermissionDenied);
        }
        if audio && !self.audio_available {
            return Err(NegotiationError::DeviceUnavailable(
                "no audio input device".to_string(),
            ));
        }
        if video && !self.video_available {
            return Err(NegotiationError::DeviceUnavailable(
                "no video input device".to_string(),
            ));
        }
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Ok(MediaStream::new(tracks))
    }
}

/// Event channel depth for transports
const TRANSPORT_EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct LoopbackState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    local_tracks: usize,
    closed: bool,
}

/// Deterministic in-process peer transport.
///
/// Produces synthetic descriptions and records everything applied to it;
/// used for same-process sessions and throughout the test suite.
pub struct LoopbackPeerTransport {
    state: parking_lot::Mutex<LoopbackState>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for LoopbackPeerTransport {
    fn default() -> Self {
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);
        Self {
            state: parking_lot::Mutex::new(LoopbackState::default()),
            events,
        }
    }
}

impl LoopbackPeerTransport {
    /// Create a fresh loopback transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for the session manager
    #[must_use]
    pub fn factory() -> PeerTransportFactory {
        Arc::new(|| Box::pin(async { Ok(Arc::new(Self::new()) as Arc<dyn PeerTransport>) }))
    }

    /// Candidates applied so far, in application order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// The remote description applied, if any
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    /// Whether the transport has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Inject a locally discovered candidate, as the ICE layer would
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
    }

    /// Inject an arriving remote stream, as the track layer would
    pub fn emit_remote_stream(&self, stream: MediaStream) {
        let _ = self.events.send(TransportEvent::RemoteStream(stream));
    }

    /// Inject a connection state change
    pub fn emit_state(&self, state: TransportState) {
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }
}

#[async_trait]
impl PeerTransport for LoopbackPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.state.lock().closed {
            return Err(NegotiationError::Transport("transport closed".to_string()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 loopback-offer {}", Uuid::new_v4()),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Transport("transport closed".to_string()));
        }
        if state.remote_description.is_none() {
            return Err(NegotiationError::InvalidState(
                "no remote offer to answer",
            ));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("v=0 loopback-answer {}", Uuid::new_v4()),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.state.lock().local_description = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.state.lock().remote_description = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Transport("transport closed".to_string()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn attach_local_media(&self, stream: &MediaStream) -> Result<(), NegotiationError> {
        self.state.lock().local_tracks = stream.tracks.len();
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 UDP 2122260223 192.168.1.{n} 5000{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn engine() -> (NegotiationEngine, Arc<LoopbackPeerTransport>) {
        let transport = Arc::new(LoopbackPeerTransport::new());
        let engine = NegotiationEngine::new(
            transport.clone(),
            Arc::new(StaticMediaDevices::granted()),
        );
        (engine, transport)
    }

    #[tokio::test]
    async fn test_device_unavailable() {
        let engine = NegotiationEngine::new(
            Arc::new(LoopbackPeerTransport::new()),
            Arc::new(StaticMediaDevices::without_devices()),
        );
        let result = engine.acquire_local_media(true, false).await;
        assert!(matches!(result, Err(NegotiationError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let engine = NegotiationEngine::new(
            Arc::new(LoopbackPeerTransport::new()),
            Arc::new(StaticMediaDevices::denied()),
        );
        let result = engine.acquire_local_media(true, true).await;
        assert!(matches!(result, Err(NegotiationError::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_acquired_stream_matches_requested_kinds() {
        let (engine, _) = engine();
        let stream = engine.acquire_local_media(true, false).await.unwrap();
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(!stream.has_kind(TrackKind::Video));
    }

    #[tokio::test]
    async fn test_offer_requires_local_media() {
        let (engine, _) = engine();
        let result = engine.create_offer().await;
        assert!(matches!(result, Err(NegotiationError::InvalidState(_))));

        engine.acquire_local_media(true, false).await.unwrap();
        let offer = engine.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
    }

    #[tokio::test]
    async fn test_answer_requires_remote_description() {
        let (engine, _) = engine();
        engine.acquire_local_media(true, false).await.unwrap();

        let result = engine.create_answer().await;
        assert!(matches!(result, Err(NegotiationError::InvalidState(_))));

        engine
            .apply_remote_description(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0 remote".to_string(),
            })
            .await
            .unwrap();
        let answer = engine.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
    }

    #[tokio::test]
    async fn test_remote_description_applied_exactly_once() {
        let (engine, _) = engine();
        let desc = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 remote".to_string(),
        };
        engine.apply_remote_description(desc.clone()).await.unwrap();

        let second = engine.apply_remote_description(desc).await;
        assert!(matches!(second, Err(NegotiationError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let (engine, transport) = engine();

        engine.add_remote_candidate(candidate(1)).await.unwrap();
        engine.add_remote_candidate(candidate(2)).await.unwrap();
        engine.add_remote_candidate(candidate(3)).await.unwrap();
        assert!(transport.applied_candidates().is_empty());

        engine
            .apply_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0 remote".to_string(),
            })
            .await
            .unwrap();

        let applied = transport.applied_candidates();
        assert_eq!(applied, vec![candidate(1), candidate(2), candidate(3)]);
    }

    #[tokio::test]
    async fn test_candidates_flow_through_after_remote_description() {
        let (engine, transport) = engine();
        engine.add_remote_candidate(candidate(1)).await.unwrap();
        engine
            .apply_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0 remote".to_string(),
            })
            .await
            .unwrap();
        engine.add_remote_candidate(candidate(2)).await.unwrap();

        assert_eq!(
            transport.applied_candidates(),
            vec![candidate(1), candidate(2)]
        );
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (engine, transport) = engine();
        engine.acquire_local_media(true, true).await.unwrap();

        engine.teardown().await;
        assert!(transport.is_closed());
        engine.teardown().await;
        engine.teardown().await;

        let result = engine.create_offer().await;
        assert!(matches!(result, Err(NegotiationError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_candidates_after_teardown_are_ignored() {
        let (engine, transport) = engine();
        engine.teardown().await;
        engine.add_remote_candidate(candidate(1)).await.unwrap();
        assert!(transport.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_remote_audio_tracks_are_force_enabled() {
        let (engine, transport) = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_remote_stream(tx);

        let mut muted_audio = MediaTrack::new(TrackKind::Audio);
        muted_audio.enabled = false;
        let mut video = MediaTrack::new(TrackKind::Video);
        video.enabled = false;
        transport.emit_remote_stream(MediaStream::new(vec![muted_audio, video]));

        let stream = rx.recv().await.unwrap();
        assert!(stream.tracks[0].enabled, "audio must be force-enabled");
        assert!(!stream.tracks[1].enabled, "video is left as delivered");
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let (engine, transport) = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_local_ice_candidate(tx);

        transport.emit_local_candidate(candidate(7));
        assert_eq!(rx.recv().await.unwrap(), candidate(7));
    }

    #[tokio::test]
    async fn test_second_media_acquisition_rejected() {
        let (engine, _) = engine();
        engine.acquire_local_media(true, false).await.unwrap();
        let again = engine.acquire_local_media(true, false).await;
        assert!(matches!(again, Err(NegotiationError::InvalidState(_))));
    }
}
