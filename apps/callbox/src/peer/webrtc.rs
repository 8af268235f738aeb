use std::sync::Arc;

use async_trait::async_trait;
use callbox_proto::{IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    PeerError, PeerEventKind, PeerEventSink, PeerTransport, PeerTransportFactory, RemoteMedia,
    TransportState,
};
use crate::media::TrackKind;

fn setup_error(err: webrtc::Error) -> PeerError {
    PeerError::Setup(err.to_string())
}

fn negotiation_error(err: webrtc::Error) -> PeerError {
    PeerError::Negotiation(err.to_string())
}

/// Builds `webrtc`-crate peer connections with one audio and one video
/// transceiver each.
///
/// Local tracks are sent when provided; otherwise both transceivers are
/// receive-only.
pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    local_tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            ice_servers,
            local_tracks: Vec::new(),
        })
    }

    pub fn with_local_tracks(mut self, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        self.local_tracks = tracks;
        self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Box<dyn PeerTransport>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(setup_error)?,
        );

        if self.local_tracks.is_empty() {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                peer_connection
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(setup_error)?;
            }
        } else {
            for track in &self.local_tracks {
                let sender = peer_connection
                    .add_track(Arc::clone(track))
                    .await
                    .map_err(setup_error)?;
                // Interceptors only run while incoming RTCP is read.
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while sender.read(&mut buf).await.is_ok() {}
                });
            }
        }

        install_callbacks(&peer_connection, &events);
        debug!(call = events.call(), "peer connection created");
        Ok(Box::new(WebRtcPeerTransport { peer_connection }))
    }
}

fn install_callbacks(peer_connection: &RTCPeerConnection, events: &PeerEventSink) {
    let candidate_events = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.emit(PeerEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(err) => warn!(error = %err, "failed to serialize local candidate"),
            }
        })
    }));

    let track_events = events.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                events.emit(PeerEventKind::RemoteMedia(RemoteMedia {
                    stream_id: track.stream_id(),
                    kind,
                }));
            })
        },
    ));

    let state_events = events.clone();
    peer_connection.on_ice_connection_state_change(Box::new(
        move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(call = events.call(), ?state, "ice connection state changed");
                if let Some(state) = map_ice_state(state) {
                    events.emit(PeerEventKind::StateChanged(state));
                }
            })
        },
    ));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<TransportState> {
    match state {
        RTCIceConnectionState::New => Some(TransportState::New),
        RTCIceConnectionState::Checking => Some(TransportState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(TransportState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCIceConnectionState::Failed => Some(TransportState::Failed),
        RTCIceConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

pub struct WebRtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(negotiation_error)?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let sdp = description.sdp;
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
            SdpKind::Rollback => {
                return Err(PeerError::Negotiation(
                    "rollback descriptions are not supported".into(),
                ));
            }
        }
        .map_err(negotiation_error)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| PeerError::Candidate(err.to_string()))
    }

    async fn stop_remote_media(&self) {
        for transceiver in self.peer_connection.get_transceivers().await {
            if let Err(err) = transceiver.stop().await {
                debug!(error = %err, "failed to stop transceiver");
            }
        }
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            warn!(error = %err, "failed to close peer connection");
        }
    }
}
