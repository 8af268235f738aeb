//! One running client: relay connection, call negotiator, chat and local
//! media driven from a single task.
//!
//! User input arrives as [`SessionCommand`]s and everything worth showing
//! leaves as [`SessionEvent`]s, so the prompt in `main.rs` and the tests drive
//! the session the same way.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallError, CallEvent, CallNegotiator};
use crate::chat::{ChatEntry, ChatRelay};
use crate::config::ClientConfig;
use crate::identity::{generate_identity, validate_remote};
use crate::media::{LocalMedia, TrackKind};
use crate::peer::{PeerEvent, PeerTransportFactory};
use crate::signaling::{
    ConnectionStatus, SignalSender, SignalingClient, SignalingError, SignalingEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Call(String),
    /// Select a remote identity for chat without calling it.
    AwaitPeer(String),
    Hangup,
    Chat(String),
    Toggle(TrackKind),
    /// Adopt the given identity, or a freshly generated one.
    RenewIdentity(Option<String>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connection(ConnectionStatus),
    Call(CallEvent),
    Chat(ChatEntry),
    Media { kind: TrackKind, enabled: bool },
    Identity(String),
    StandbyPeer(String),
    /// A command could not be carried out.
    Rejected(String),
}

pub struct ClientSession {
    signaling: Arc<SignalingClient>,
    negotiator: CallNegotiator,
    chat: ChatRelay,
    media: LocalMedia,
    standby: Option<String>,
    signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    call_events: mpsc::UnboundedReceiver<CallEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientSession {
    /// Connects to the relay and assembles the session. Fails when the relay
    /// cannot be reached at all.
    pub async fn connect(
        config: &ClientConfig,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SignalingError> {
        let media = LocalMedia::acquire(config.media.clone());
        Self::connect_with_media(config, factory, media).await
    }

    /// Like [`ClientSession::connect`], with capture that was acquired up
    /// front so its tracks could be handed to the transport factory.
    pub async fn connect_with_media(
        config: &ClientConfig,
        factory: Arc<dyn PeerTransportFactory>,
        mut media: LocalMedia,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SignalingError> {
        let (signaling, signaling_events) = SignalingClient::connect(
            config.relay_url.as_str(),
            &config.identity,
            config.reconnect,
        )
        .await?;
        let signaling = Arc::new(signaling);
        let signals: Arc<dyn SignalSender> = signaling.clone();

        let (negotiator, peer_events) =
            CallNegotiator::new(config.identity.clone(), factory, Arc::clone(&signals));
        let mut negotiator = negotiator.with_candidate_policy(config.candidate_policy);
        let call_events = negotiator.subscribe();
        let (events, events_rx) = mpsc::unbounded_channel();
        media.start_source();

        Ok((
            Self {
                signaling,
                negotiator,
                chat: ChatRelay::new(signals),
                media,
                standby: None,
                signaling_events,
                peer_events,
                call_events,
                events,
            },
            events_rx,
        ))
    }

    pub fn identity(&self) -> &str {
        self.negotiator.local_identity()
    }

    pub fn spawn(self) -> SessionHandle {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(commands_rx));
        SessionHandle { commands, task }
    }

    /// Processes commands and network events until `Shutdown` or until every
    /// command sender is gone, then releases media and the relay connection.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.signaling_events.recv() => self.handle_signaling(event).await,
                Some(event) = self.peer_events.recv() => self.negotiator.handle_peer_event(event).await,
                Some(event) = self.call_events.recv() => self.publish(SessionEvent::Call(event)),
            }
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Call(remote) => {
                if !self.media.is_available() {
                    self.reject(CallError::MediaUnavailable);
                    return;
                }
                if let Err(err) = self.negotiator.initiate_call(&remote).await {
                    self.reject(err);
                }
            }
            SessionCommand::AwaitPeer(remote) => {
                match validate_remote(self.negotiator.local_identity(), &remote) {
                    Ok(remote) => {
                        info!(remote = %remote, "waiting for peer");
                        self.standby = Some(remote.clone());
                        self.publish(SessionEvent::StandbyPeer(remote));
                    }
                    Err(err) => self.reject(err),
                }
            }
            SessionCommand::Hangup => {
                if !self.negotiator.hangup().await {
                    debug!("hangup with no call in progress");
                }
                self.standby = None;
            }
            SessionCommand::Chat(text) => {
                let remote = self
                    .negotiator
                    .remote()
                    .or(self.standby.as_deref())
                    .map(str::to_string);
                let local = self.negotiator.local_identity().to_string();
                match self.chat.send(&local, remote.as_deref(), &text) {
                    Ok(entry) => {
                        let entry = entry.clone();
                        self.publish(SessionEvent::Chat(entry));
                    }
                    Err(err) => self.reject(err),
                }
            }
            SessionCommand::Toggle(kind) => match self.media.toggle(kind) {
                Some(enabled) => self.publish(SessionEvent::Media { kind, enabled }),
                None => self.reject(CallError::MediaUnavailable),
            },
            SessionCommand::RenewIdentity(requested) => self.renew_identity(requested),
            SessionCommand::Shutdown => {}
        }
    }

    fn renew_identity(&mut self, requested: Option<String>) {
        if self.negotiator.remote().is_some() {
            self.reject("hang up before changing identity");
            return;
        }
        let identity = match requested.as_deref().map(str::trim) {
            Some("") => {
                self.reject("identity cannot be empty");
                return;
            }
            Some(identity) => identity.to_string(),
            None => generate_identity(),
        };

        self.negotiator.set_local_identity(identity.clone());
        // Kept even if the send fails; the next reconnect registers it.
        let sent = self.signaling.reregister(&identity);
        info!(identity = %identity, "local identity changed");
        self.publish(SessionEvent::Identity(identity));
        if let Err(err) = sent {
            self.reject(err);
        }
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Status(status) => self.publish(SessionEvent::Connection(status)),
            SignalingEvent::Call(signal) => {
                let from = signal.from().to_string();
                if let Err(err) = self.negotiator.handle_signal(signal).await {
                    warn!(from = %from, error = %err, "failed to handle call signal");
                    self.reject(err);
                }
            }
            SignalingEvent::Chat { from, text } => {
                let entry = self.chat.receive(&from, &text).clone();
                self.publish(SessionEvent::Chat(entry));
            }
        }
    }

    async fn teardown(&mut self) {
        self.negotiator.hangup().await;
        self.media.release();
        self.signaling.close().await;
        info!("session closed");
    }

    fn reject(&self, reason: impl ToString) {
        self.publish(SessionEvent::Rejected(reason.to_string()));
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Command side of a spawned [`ClientSession`].
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns `false` once the session has stopped.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        if let Err(err) = self.task.await {
            warn!(error = %err, "session task ended abnormally");
        }
    }
}
