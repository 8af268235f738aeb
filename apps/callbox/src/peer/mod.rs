//! Media peer transport abstraction.
//!
//! A [`PeerTransport`] is one peer connection for one call. It never talks to
//! the relay itself: local candidates, remote media and connection-state
//! changes are pushed into a [`PeerEventSink`] and the negotiator decides what
//! to do with them. Every event carries the id of the call that created the
//! transport, so late events from a torn-down call can be told apart.

use async_trait::async_trait;
use callbox_proto::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::TrackKind;

pub mod mock;
pub mod webrtc;

pub type CallId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("failed to set up peer connection: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid remote candidate: {0}")]
    Candidate(String),
    #[error("peer connection is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States that end the call.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportState::New => "new",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    RemoteMedia(RemoteMedia),
    StateChanged(TransportState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub call: CallId,
    pub kind: PeerEventKind,
}

#[derive(Clone, Debug)]
pub struct PeerEventSink {
    call: CallId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(call: CallId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { call, tx }
    }

    pub fn call(&self) -> CallId {
        self.call
    }

    /// Events emitted after the session stopped listening are discarded.
    pub fn emit(&self, kind: PeerEventKind) {
        let _ = self.tx.send(PeerEvent {
            call: self.call,
            kind,
        });
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Creates an answer to the installed remote offer and installs it locally.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Stops every track received from the remote peer.
    async fn stop_remote_media(&self);

    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Box<dyn PeerTransport>, PeerError>;
}
