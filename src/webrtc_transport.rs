//! Peer transport backed by a real `RTCPeerConnection`
//!
//! Adapts the `webrtc` crate to the [`PeerTransport`] contract used by
//! [`crate::negotiation::NegotiationEngine`]. One transport per call;
//! dropped tracks and the connection itself are released on `close`.

use crate::negotiation::{
    MediaStream, NegotiationError, PeerTransport, PeerTransportFactory, TrackKind, TransportEvent,
    TransportState,
};
use crate::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Event channel depth; matches the loopback transport
const EVENT_CAPACITY: usize = 64;

/// STUN/TURN server configuration for candidate gathering
#[derive(Debug, Clone, Default)]
pub struct IceServerConfig {
    /// Server URLs (`stun:` or `turn:` schemes)
    pub urls: Vec<String>,
    /// TURN username, if required
    pub username: Option<String>,
    /// TURN credential, if required
    pub credential: Option<String>,
}

fn map_err<E: std::fmt::Display>(e: E) -> NegotiationError {
    NegotiationError::Transport(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

/// [`PeerTransport`] over a real peer connection
pub struct WebRtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    events: broadcast::Sender<TransportEvent>,
}

impl WebRtcPeerTransport {
    /// Create a transport with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if the media engine or peer connection cannot be built
    pub async fn new(ice_servers: &[IceServerConfig]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(map_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(map_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await.map_err(map_err)?);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let candidate_events = candidate_events.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = candidate_events.send(TransportEvent::LocalCandidate(
                                IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "candidate serialization failed");
                        }
                    }
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let state_events = state_events.clone();
                Box::pin(async move {
                    let _ = state_events.send(TransportEvent::StateChanged(map_state(state)));
                })
            },
        ));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                // Remote tracks are surfaced disabled here; the engine
                // corrects audio before anything downstream sees it.
                let stream = MediaStream {
                    id: track.stream_id(),
                    tracks: vec![crate::negotiation::MediaTrack {
                        id: track.id(),
                        kind,
                        enabled: false,
                    }],
                };
                let _ = track_events.send(TransportEvent::RemoteStream(stream));
            })
        }));

        Ok(Self {
            peer_connection,
            events,
        })
    }

    /// Factory for the session manager; one connection per call
    #[must_use]
    pub fn factory(ice_servers: Vec<IceServerConfig>) -> PeerTransportFactory {
        Arc::new(move || {
            let servers = ice_servers.clone();
            Box::pin(async move {
                let transport = Self::new(&servers).await?;
                Ok(Arc::new(transport) as Arc<dyn PeerTransport>)
            })
        })
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(map_err)
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(map_err)?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(map_err)?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc = Self::to_rtc(&description)?;
        self.peer_connection
            .set_local_description(rtc)
            .await
            .map_err(map_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc = Self::to_rtc(&description)?;
        self.peer_connection
            .set_remote_description(rtc)
            .await
            .map_err(map_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(map_err)
    }

    async fn attach_local_media(&self, stream: &MediaStream) -> Result<(), NegotiationError> {
        for track in &stream.tracks {
            let codec = match track.kind {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
            };
            let stream_label = match track.kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            let local: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
                codec,
                track.id.clone(),
                stream_label.to_string(),
            ));
            self.peer_connection
                .add_track(local)
                .await
                .map_err(map_err)?;
            tracing::debug!(track_id = %track.id, kind = ?track.kind, "local track attached");
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection.close().await.map_err(map_err)
    }
}
