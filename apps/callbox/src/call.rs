//! Call negotiation state machine.
//!
//! [`CallNegotiator`] owns at most one call. Its [`CallState`] carries exactly
//! the data that is valid in each phase, so a remote description can only be
//! reached through states that have one. Observers subscribe to [`CallEvent`]s
//! instead of reading the state.
//!
//! The negotiator is driven from a single task: signaling envelopes, peer
//! events and user commands are handed to it one at a time.

use std::sync::Arc;

use callbox_proto::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::identity::{IdentityError, validate_remote};
use crate::peer::{
    CallId, PeerError, PeerEvent, PeerEventKind, PeerEventSink, PeerTransport,
    PeerTransportFactory, RemoteMedia, TransportState,
};
use crate::signaling::{CallSignal, SignalSender, SignalingError};

/// What to do with a candidate that arrives while our offer is still
/// unanswered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidatePolicy {
    #[default]
    Discard,
    /// Hold them and attach them right after the answer is installed.
    BufferUntilAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Calling,
    IncomingRing,
    Negotiating,
    Connected,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CallPhase::Idle => "idle",
            CallPhase::Calling => "calling",
            CallPhase::IncomingRing => "incoming-ring",
            CallPhase::Negotiating => "negotiating",
            CallPhase::Connected => "connected",
        };
        f.write_str(label)
    }
}

pub struct ActiveCall {
    id: CallId,
    remote: String,
    transport: Box<dyn PeerTransport>,
}

impl ActiveCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

pub enum CallState {
    Idle,
    /// Offer sent, waiting for the answer.
    Calling {
        call: ActiveCall,
        local_description: SessionDescription,
        early_candidates: Vec<IceCandidate>,
    },
    /// Remote offer installed, answer being produced.
    IncomingRing {
        call: ActiveCall,
        remote_description: SessionDescription,
    },
    Negotiating {
        call: ActiveCall,
        local_description: SessionDescription,
        remote_description: SessionDescription,
    },
    Connected {
        call: ActiveCall,
        local_description: SessionDescription,
        remote_description: SessionDescription,
        media: RemoteMedia,
    },
}

impl CallState {
    pub fn phase(&self) -> CallPhase {
        match self {
            CallState::Idle => CallPhase::Idle,
            CallState::Calling { .. } => CallPhase::Calling,
            CallState::IncomingRing { .. } => CallPhase::IncomingRing,
            CallState::Negotiating { .. } => CallPhase::Negotiating,
            CallState::Connected { .. } => CallPhase::Connected,
        }
    }

    pub fn call(&self) -> Option<&ActiveCall> {
        match self {
            CallState::Idle => None,
            CallState::Calling { call, .. }
            | CallState::IncomingRing { call, .. }
            | CallState::Negotiating { call, .. }
            | CallState::Connected { call, .. } => Some(call),
        }
    }

    pub fn remote(&self) -> Option<&str> {
        self.call().map(ActiveCall::remote)
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        match self {
            CallState::Idle | CallState::Calling { .. } => None,
            CallState::IncomingRing {
                remote_description, ..
            }
            | CallState::Negotiating {
                remote_description, ..
            }
            | CallState::Connected {
                remote_description, ..
            } => Some(remote_description),
        }
    }

    fn into_call(self) -> Option<ActiveCall> {
        match self {
            CallState::Idle => None,
            CallState::Calling { call, .. }
            | CallState::IncomingRing { call, .. }
            | CallState::Negotiating { call, .. }
            | CallState::Connected { call, .. } => Some(call),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    TransportLost(TransportState),
    NegotiationFailed(String),
    /// Our outgoing offer lost an offer collision.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    PhaseChanged {
        phase: CallPhase,
        remote: Option<String>,
    },
    Connected {
        remote: String,
        media: RemoteMedia,
    },
    Ended {
        remote: String,
        reason: EndReason,
    },
    OfferIgnored {
        from: String,
    },
    CandidateDiscarded {
        from: String,
    },
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress ({0})")]
    Busy(CallPhase),
    #[error(transparent)]
    InvalidRemote(#[from] IdentityError),
    #[error("local media is unavailable; calls can only be answered")]
    MediaUnavailable,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// On an offer collision the lexicographically lower identity keeps its
/// outgoing offer and the higher one answers instead.
pub fn keeps_outgoing_offer(local: &str, remote: &str) -> bool {
    local < remote
}

enum OfferDecision {
    Accept,
    Yield,
    Ignore,
}

enum CandidateAction {
    Discard,
    Buffer,
    Attach,
}

pub struct CallNegotiator {
    local: String,
    factory: Arc<dyn PeerTransportFactory>,
    signals: Arc<dyn SignalSender>,
    candidate_policy: CandidatePolicy,
    state: CallState,
    next_call: CallId,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    observer: Option<mpsc::UnboundedSender<CallEvent>>,
}

impl CallNegotiator {
    /// Returns the negotiator and the stream its transports report into; feed
    /// that stream back through [`CallNegotiator::handle_peer_event`].
    pub fn new(
        local: impl Into<String>,
        factory: Arc<dyn PeerTransportFactory>,
        signals: Arc<dyn SignalSender>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        (
            Self {
                local: local.into(),
                factory,
                signals,
                candidate_policy: CandidatePolicy::default(),
                state: CallState::Idle,
                next_call: 0,
                peer_events,
                observer: None,
            },
            peer_rx,
        )
    }

    pub fn with_candidate_policy(mut self, policy: CandidatePolicy) -> Self {
        self.candidate_policy = policy;
        self
    }

    /// Routes every later [`CallEvent`] to the returned receiver. Replaces
    /// any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observer = Some(tx);
        rx
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn phase(&self) -> CallPhase {
        self.state.phase()
    }

    pub fn remote(&self) -> Option<&str> {
        self.state.remote()
    }

    pub fn local_identity(&self) -> &str {
        &self.local
    }

    pub fn set_local_identity(&mut self, identity: impl Into<String>) {
        self.local = identity.into();
    }

    /// Starts a call to `remote`: creates a transport and sends our offer.
    pub async fn initiate_call(&mut self, remote: &str) -> Result<(), CallError> {
        if !matches!(self.state, CallState::Idle) {
            return Err(CallError::Busy(self.phase()));
        }
        let remote = validate_remote(&self.local, remote)?;

        let call = self.open_call(&remote).await?;
        let offer = match call.transport.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                call.transport.close().await;
                return Err(err.into());
            }
        };
        if let Err(err) = self.signals.send_offer(&remote, &offer) {
            call.transport.close().await;
            return Err(err.into());
        }

        info!(remote = %remote, call = call.id, "offer sent");
        self.enter(CallState::Calling {
            call,
            local_description: offer,
            early_candidates: Vec::new(),
        });
        Ok(())
    }

    pub async fn handle_signal(&mut self, signal: CallSignal) -> Result<(), CallError> {
        match signal {
            CallSignal::Offer { from, description } => self.handle_offer(from, description).await,
            CallSignal::Answer { from, description } => {
                self.handle_answer(&from, description).await
            }
            CallSignal::Candidate { from, candidate } => {
                self.handle_candidate(&from, candidate).await;
                Ok(())
            }
        }
    }

    /// Auto-accepts an offer when idle. While busy, only an offer from the
    /// identity we are calling is considered (see [`keeps_outgoing_offer`]);
    /// every other offer is ignored.
    pub async fn handle_offer(
        &mut self,
        from: String,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let decision = match &self.state {
            CallState::Idle => OfferDecision::Accept,
            CallState::Calling { call, .. } if call.remote == from => {
                if keeps_outgoing_offer(&self.local, &from) {
                    OfferDecision::Ignore
                } else {
                    OfferDecision::Yield
                }
            }
            _ => OfferDecision::Ignore,
        };

        match decision {
            OfferDecision::Ignore => {
                debug!(from = %from, phase = %self.phase(), "ignoring offer");
                self.emit(CallEvent::OfferIgnored { from });
                Ok(())
            }
            OfferDecision::Yield => {
                info!(remote = %from, "offer collision; answering instead of calling");
                self.teardown(EndReason::Superseded).await;
                self.accept_offer(from, offer).await
            }
            OfferDecision::Accept => self.accept_offer(from, offer).await,
        }
    }

    async fn accept_offer(
        &mut self,
        from: String,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let call = self.open_call(&from).await?;
        if let Err(err) = call.transport.set_remote_description(offer.clone()).await {
            warn!(from = %from, error = %err, "rejecting unusable offer");
            call.transport.close().await;
            return Err(err.into());
        }
        info!(from = %from, call = call.id, "incoming call");
        self.enter(CallState::IncomingRing {
            call,
            remote_description: offer,
        });

        let answer = match &self.state {
            CallState::IncomingRing { call, .. } => call.transport.create_answer().await,
            _ => return Ok(()),
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                self.teardown(EndReason::NegotiationFailed(err.to_string()))
                    .await;
                return Err(err.into());
            }
        };
        if let Err(err) = self.signals.send_answer(&from, &answer) {
            self.teardown(EndReason::NegotiationFailed(err.to_string()))
                .await;
            return Err(err.into());
        }

        match self.take_state() {
            CallState::IncomingRing {
                call,
                remote_description,
            } => {
                debug!(remote = %from, call = call.id, "answer sent");
                self.enter(CallState::Negotiating {
                    call,
                    local_description: answer,
                    remote_description,
                });
            }
            other => self.state = other,
        }
        Ok(())
    }

    /// Installs the answer to our outstanding offer. Answers that do not
    /// match the call in progress are ignored.
    pub async fn handle_answer(
        &mut self,
        from: &str,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        match self.take_state() {
            CallState::Calling {
                call,
                local_description,
                early_candidates,
            } if call.remote == from => {
                if let Err(err) = call.transport.set_remote_description(answer.clone()).await {
                    self.state = CallState::Calling {
                        call,
                        local_description,
                        early_candidates,
                    };
                    self.teardown(EndReason::NegotiationFailed(err.to_string()))
                        .await;
                    return Err(err.into());
                }
                for candidate in early_candidates {
                    attach_candidate(&call, candidate).await;
                }
                debug!(remote = %from, call = call.id, "answer installed");
                self.enter(CallState::Negotiating {
                    call,
                    local_description,
                    remote_description: answer,
                });
            }
            other => {
                debug!(from = %from, phase = %other.phase(), "ignoring unexpected answer");
                self.state = other;
            }
        }
        Ok(())
    }

    /// Attaches a remote candidate once a remote description is installed.
    /// Earlier candidates are discarded, or held when buffering is enabled.
    pub async fn handle_candidate(&mut self, from: &str, candidate: IceCandidate) {
        let action = match &self.state {
            state if state.remote() != Some(from) => CandidateAction::Discard,
            CallState::Calling { .. } => match self.candidate_policy {
                CandidatePolicy::Discard => CandidateAction::Discard,
                CandidatePolicy::BufferUntilAnswer => CandidateAction::Buffer,
            },
            _ => CandidateAction::Attach,
        };

        match action {
            CandidateAction::Discard => {
                debug!(from = %from, phase = %self.phase(), "discarding remote candidate");
                self.emit(CallEvent::CandidateDiscarded {
                    from: from.to_string(),
                });
            }
            CandidateAction::Buffer => {
                if let CallState::Calling {
                    early_candidates, ..
                } = &mut self.state
                {
                    early_candidates.push(candidate);
                }
            }
            CandidateAction::Attach => {
                if let Some(call) = self.state.call() {
                    attach_candidate(call, candidate).await;
                }
            }
        }
    }

    /// Applies one event reported by a transport. Events from transports of
    /// earlier calls are dropped.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(call) = self.state.call() else {
            debug!(call = event.call, "peer event with no call in progress");
            return;
        };
        if call.id != event.call {
            debug!(call = event.call, current = call.id, "stale peer event");
            return;
        }
        let remote = call.remote.clone();

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if let Err(err) = self.signals.send_candidate(&remote, &candidate) {
                    warn!(remote = %remote, error = %err, "failed to send local candidate");
                }
            }
            PeerEventKind::RemoteMedia(media) => match self.take_state() {
                CallState::Negotiating {
                    call,
                    local_description,
                    remote_description,
                } => {
                    info!(remote = %remote, call = call.id, stream = %media.stream_id, "call connected");
                    self.enter(CallState::Connected {
                        call,
                        local_description,
                        remote_description,
                        media: media.clone(),
                    });
                    self.emit(CallEvent::Connected { remote, media });
                }
                other => self.state = other,
            },
            PeerEventKind::StateChanged(state) if state.is_terminal() => {
                warn!(remote = %remote, state = %state, "peer transport lost");
                self.teardown(EndReason::TransportLost(state)).await;
            }
            PeerEventKind::StateChanged(state) => {
                debug!(remote = %remote, state = %state, "peer transport state");
            }
        }
    }

    /// Ends the current call. Returns `false` when there was none.
    pub async fn hangup(&mut self) -> bool {
        if matches!(self.state, CallState::Idle) {
            return false;
        }
        self.teardown(EndReason::LocalHangup).await;
        true
    }

    async fn open_call(&mut self, remote: &str) -> Result<ActiveCall, PeerError> {
        self.next_call += 1;
        let id = self.next_call;
        let sink = PeerEventSink::new(id, self.peer_events.clone());
        let transport = self.factory.create(sink).await?;
        Ok(ActiveCall {
            id,
            remote: remote.to_string(),
            transport,
        })
    }

    async fn teardown(&mut self, reason: EndReason) {
        let state = self.take_state();
        let phase = state.phase();
        let Some(call) = state.into_call() else {
            return;
        };

        call.transport.stop_remote_media().await;
        call.transport.close().await;
        info!(remote = %call.remote, call = call.id, phase = %phase, reason = ?reason, "call ended");

        self.enter(CallState::Idle);
        self.emit(CallEvent::Ended {
            remote: call.remote,
            reason,
        });
    }

    fn take_state(&mut self) -> CallState {
        std::mem::replace(&mut self.state, CallState::Idle)
    }

    fn enter(&mut self, state: CallState) {
        self.state = state;
        self.emit(CallEvent::PhaseChanged {
            phase: self.state.phase(),
            remote: self.state.remote().map(str::to_string),
        });
    }

    fn emit(&self, event: CallEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}

async fn attach_candidate(call: &ActiveCall, candidate: IceCandidate) {
    if let Err(err) = call.transport.add_ice_candidate(candidate).await {
        warn!(remote = %call.remote, error = %err, "failed to attach remote candidate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn lower_identity_keeps_its_offer() {
        assert!(keeps_outgoing_offer("calm-ocean-7", "sun-star-3"));
        assert!(!keeps_outgoing_offer("sun-star-3", "calm-ocean-7"));
    }

    #[test_timeout::timeout]
    fn idle_has_no_remote_description() {
        let state = CallState::Idle;
        assert_eq!(state.phase(), CallPhase::Idle);
        assert!(state.remote().is_none());
        assert!(state.remote_description().is_none());
    }
}
