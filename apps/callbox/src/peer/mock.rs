//! In-process peer transport for tests and relay-only runs.
//!
//! Descriptions are plain strings naming their author, so two mock transports
//! that exchanged an offer and an answer know about each other. When they
//! share a [`MockPeerNetwork`], closing one reports `Disconnected` to the
//! other, which is what a real peer observes once ICE consent stops.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use callbox_proto::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;

use super::{
    PeerError, PeerEventKind, PeerEventSink, PeerTransport, PeerTransportFactory, RemoteMedia,
    TransportState,
};
use crate::media::TrackKind;

/// Everything a mock transport was asked to do.
#[derive(Debug, Default, Clone)]
pub struct TransportLog {
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub stop_remote_media_calls: usize,
    pub close_calls: usize,
}

#[derive(Default)]
pub struct MockPeerNetwork {
    sinks: Mutex<HashMap<String, PeerEventSink>>,
}

impl MockPeerNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(&self, owner: &str, sink: PeerEventSink) {
        self.sinks.lock().insert(owner.to_string(), sink);
    }

    fn notify(&self, owner: &str, kind: PeerEventKind) {
        let sink = self.sinks.lock().get(owner).cloned();
        if let Some(sink) = sink {
            sink.emit(kind);
        }
    }
}

pub struct MockPeerFactory {
    owner: String,
    network: Option<Arc<MockPeerNetwork>>,
    auto_media: bool,
    logs: Mutex<Vec<Arc<Mutex<TransportLog>>>>,
}

impl MockPeerFactory {
    /// Transports that never produce candidates or media on their own.
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            network: None,
            auto_media: false,
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Transports that behave like a reachable peer: once both descriptions
    /// are in place they emit one local candidate and then remote media.
    pub fn linked(owner: &str, network: Arc<MockPeerNetwork>) -> Self {
        Self {
            owner: owner.to_string(),
            network: Some(network),
            auto_media: true,
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.logs.lock().len()
    }

    /// Snapshot of the log of the `index`-th transport created.
    pub fn log(&self, index: usize) -> Option<TransportLog> {
        self.logs.lock().get(index).map(|log| log.lock().clone())
    }

    pub fn last_log(&self) -> Option<TransportLog> {
        self.logs.lock().last().map(|log| log.lock().clone())
    }
}

#[async_trait]
impl PeerTransportFactory for MockPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Box<dyn PeerTransport>, PeerError> {
        let log = Arc::new(Mutex::new(TransportLog::default()));
        self.logs.lock().push(Arc::clone(&log));
        if let Some(network) = &self.network {
            network.attach(&self.owner, events.clone());
        }
        Ok(Box::new(MockPeerTransport {
            owner: self.owner.clone(),
            events,
            log,
            network: self.network.clone(),
            remote_owner: Mutex::new(None),
            auto_media: self.auto_media,
        }))
    }
}

pub struct MockPeerTransport {
    owner: String,
    events: PeerEventSink,
    log: Arc<Mutex<TransportLog>>,
    network: Option<Arc<MockPeerNetwork>>,
    remote_owner: Mutex<Option<String>>,
    auto_media: bool,
}

impl MockPeerTransport {
    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let label = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        };
        let description = SessionDescription {
            kind,
            sdp: format!("mock-{label} from {}", self.owner),
        };
        self.log.lock().local_descriptions.push(description.clone());
        description
    }

    fn go_live(&self) {
        if !self.auto_media {
            return;
        }
        self.events.emit(PeerEventKind::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host ({})", self.owner),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.events.emit(PeerEventKind::StateChanged(TransportState::Connected));
        self.events.emit(PeerEventKind::RemoteMedia(RemoteMedia {
            stream_id: format!("stream-{}", self.events.call()),
            kind: TrackKind::Video,
        }));
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.log.lock().remote_descriptions.is_empty() {
            return Err(PeerError::Negotiation("no remote offer installed".into()));
        }
        let answer = self.describe(SdpKind::Answer);
        self.go_live();
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let remote = description
            .sdp
            .split_once(" from ")
            .map(|(_, owner)| owner.to_string());
        *self.remote_owner.lock() = remote;
        let is_answer = description.kind == SdpKind::Answer;
        self.log.lock().remote_descriptions.push(description);
        if is_answer {
            self.go_live();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut log = self.log.lock();
        if log.remote_descriptions.is_empty() {
            return Err(PeerError::Candidate(
                "candidate added before remote description".into(),
            ));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn stop_remote_media(&self) {
        self.log.lock().stop_remote_media_calls += 1;
    }

    async fn close(&self) {
        self.log.lock().close_calls += 1;
        let remote = self.remote_owner.lock().take();
        if let (Some(network), Some(remote)) = (&self.network, remote) {
            network.notify(&remote, PeerEventKind::StateChanged(TransportState::Disconnected));
        }
    }
}
