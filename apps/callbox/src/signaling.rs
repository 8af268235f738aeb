//! Relay connection manager.
//!
//! [`SignalingClient`] keeps exactly one WebSocket to the relay open at a time.
//! Every time a socket opens it registers the current local identity before
//! anything else is written. When the socket closes a single supervisor task
//! waits out the [`ReconnectPolicy`] delay and dials again, so there is never
//! more than one pending attempt. Shutting the client down cancels the
//! supervisor, including a pending delay or dial.

use std::sync::Arc;
use std::time::Duration;

use callbox_proto::{ClientEnvelope, IceCandidate, RelayEnvelope, SessionDescription};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RelaySink = SplitSink<RelayStream, Message>;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("not connected to the relay")]
    NotConnected,
    #[error("failed to connect to relay at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    #[error("relay transport error: {0}")]
    Transport(#[source] Box<tungstenite::Error>),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// `None` keeps retrying until the client is closed.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Whether the `attempt`-th consecutive reconnect (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Socket open and `register` sent; waiting for the acknowledgement.
    Connecting,
    Ready { identity: String },
    Disconnected,
    Reconnecting { attempt: u32 },
    GaveUp { attempts: u32 },
}

/// Negotiation envelopes with their payloads decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    Offer {
        from: String,
        description: SessionDescription,
    },
    Answer {
        from: String,
        description: SessionDescription,
    },
    Candidate {
        from: String,
        candidate: IceCandidate,
    },
}

impl CallSignal {
    pub fn from(&self) -> &str {
        match self {
            CallSignal::Offer { from, .. }
            | CallSignal::Answer { from, .. }
            | CallSignal::Candidate { from, .. } => from,
        }
    }
}

/// What the relay connection reports to the session, already split by consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Status(ConnectionStatus),
    Call(CallSignal),
    Chat { from: String, text: String },
}

impl SignalingEvent {
    fn from_envelope(envelope: RelayEnvelope) -> Result<Self, serde_json::Error> {
        Ok(match envelope {
            RelayEnvelope::Registered { user_id } => {
                SignalingEvent::Status(ConnectionStatus::Ready { identity: user_id })
            }
            RelayEnvelope::Offer { from, offer } => SignalingEvent::Call(CallSignal::Offer {
                from,
                description: SessionDescription::from_value(&offer)?,
            }),
            RelayEnvelope::Answer { from, answer } => SignalingEvent::Call(CallSignal::Answer {
                from,
                description: SessionDescription::from_value(&answer)?,
            }),
            RelayEnvelope::Candidate { from, candidate } => {
                SignalingEvent::Call(CallSignal::Candidate {
                    from,
                    candidate: IceCandidate::from_value(&candidate)?,
                })
            }
            RelayEnvelope::Message { from, message } => SignalingEvent::Chat {
                from,
                text: message,
            },
        })
    }
}

/// Outbound half of the relay connection.
///
/// Sends fail with [`SignalingError::NotConnected`] while no socket is open;
/// nothing is queued for a later connection.
pub trait SignalSender: Send + Sync {
    fn send_envelope(&self, envelope: ClientEnvelope) -> Result<(), SignalingError>;

    fn send_offer(&self, target: &str, offer: &SessionDescription) -> Result<(), SignalingError> {
        self.send_envelope(ClientEnvelope::Offer {
            target: target.to_string(),
            offer: offer.to_value()?,
        })
    }

    fn send_answer(
        &self,
        target: &str,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send_envelope(ClientEnvelope::Answer {
            target: target.to_string(),
            answer: answer.to_value()?,
        })
    }

    fn send_candidate(&self, target: &str, candidate: &IceCandidate) -> Result<(), SignalingError> {
        self.send_envelope(ClientEnvelope::Candidate {
            target: target.to_string(),
            candidate: candidate.to_value()?,
        })
    }

    fn send_chat(&self, target: &str, text: &str) -> Result<(), SignalingError> {
        self.send_envelope(ClientEnvelope::Message {
            target: target.to_string(),
            message: text.to_string(),
        })
    }
}

struct Shared {
    identity: RwLock<String>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientEnvelope>>>,
}

pub struct SignalingClient {
    url: String,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Opens the first relay connection and starts supervising it.
    ///
    /// A failure here is returned to the caller; reconnects only begin once a
    /// connection that did open later closes.
    pub async fn connect(
        url: &str,
        identity: &str,
        policy: ReconnectPolicy,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let stream = open(url).await?;
        info!(url, identity, "connected to relay");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity: RwLock::new(identity.to_string()),
            outbound: Mutex::new(None),
        });
        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            url.to_string(),
            stream,
            policy,
            Arc::clone(&shared),
            events_tx,
            shutdown.clone(),
        ));

        Ok((
            Self {
                url: url.to_string(),
                shared,
                shutdown,
                supervisor: Mutex::new(Some(supervisor)),
            },
            events_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn identity(&self) -> String {
        self.shared.identity.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outbound.lock().is_some()
    }

    /// Adopts a new identity and registers it on the open connection.
    ///
    /// The identity is kept even when the send fails, so the next reconnect
    /// registers it.
    pub fn reregister(&self, identity: &str) -> Result<(), SignalingError> {
        *self.shared.identity.write() = identity.to_string();
        self.send_envelope(ClientEnvelope::Register {
            user_id: identity.to_string(),
        })
    }

    /// Closes the connection and stops reconnecting. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "relay supervisor ended abnormally");
            }
        }
    }
}

impl SignalSender for SignalingClient {
    fn send_envelope(&self, envelope: ClientEnvelope) -> Result<(), SignalingError> {
        let outbound = self.shared.outbound.lock();
        let tx = outbound.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.send(envelope).map_err(|_| SignalingError::NotConnected)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn open(url: &str) -> Result<RelayStream, SignalingError> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|source| SignalingError::Connect {
            url: url.to_string(),
            source: Box::new(source),
        })?;
    Ok(stream)
}

async fn supervise(
    url: String,
    mut stream: RelayStream,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    shutdown: CancellationToken,
) {
    'session: loop {
        run_connection(stream, &shared, &events, &shutdown).await;
        let _ = events.send(SignalingEvent::Status(ConnectionStatus::Disconnected));
        if shutdown.is_cancelled() {
            break;
        }

        let mut attempt = 0;
        stream = loop {
            attempt += 1;
            if !policy.allows(attempt) {
                let attempts = attempt - 1;
                warn!(attempts, "giving up on the relay");
                let _ = events.send(SignalingEvent::Status(ConnectionStatus::GaveUp { attempts }));
                break 'session;
            }

            let _ = events.send(SignalingEvent::Status(ConnectionStatus::Reconnecting {
                attempt,
            }));
            let dialed = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = async {
                    tokio::time::sleep(policy.delay).await;
                    open(&url).await
                } => Some(result),
            };
            match dialed {
                None => break 'session,
                Some(Ok(stream)) => {
                    info!(attempt, "reconnected to relay");
                    break stream;
                }
                Some(Err(err)) => warn!(attempt, error = %err, "reconnect failed"),
            }
        };
    }
    debug!("relay supervisor stopped");
}

async fn run_connection(
    stream: RelayStream,
    shared: &Shared,
    events: &mpsc::UnboundedSender<SignalingEvent>,
    shutdown: &CancellationToken,
) {
    let (mut write, mut read) = stream.split();

    let identity = shared.identity.read().clone();
    let register = ClientEnvelope::Register {
        user_id: identity.clone(),
    };
    if let Err(err) = send_frame(&mut write, &register).await {
        warn!(identity = %identity, error = %err, "failed to register with relay");
        return;
    }
    debug!(identity = %identity, "register sent");
    let _ = events.send(SignalingEvent::Status(ConnectionStatus::Connecting));

    let (tx, mut rx) = mpsc::unbounded_channel();
    *shared.outbound.lock() = Some(tx);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(envelope) = rx.recv() => {
                if let Err(err) = send_frame(&mut write, &envelope).await {
                    warn!(kind = %envelope.kind(), error = %err, "failed to send envelope");
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), events),
                Some(Ok(Message::Close(_))) | None => {
                    info!("relay closed the connection");
                    break;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "relay connection failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    shared.outbound.lock().take();
}

async fn send_frame(write: &mut RelaySink, envelope: &ClientEnvelope) -> Result<(), SignalingError> {
    let json = serde_json::to_string(envelope)?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|err| SignalingError::Transport(Box::new(err)))
}

fn dispatch(text: &str, events: &mpsc::UnboundedSender<SignalingEvent>) {
    let envelope = match RelayEnvelope::parse(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "ignoring malformed relay frame");
            return;
        }
    };
    let kind = envelope.kind();
    match SignalingEvent::from_envelope(envelope) {
        Ok(event) => {
            debug!(kind = %kind, "relay envelope received");
            let _ = events.send(event);
        }
        Err(err) => warn!(kind = %kind, error = %err, "ignoring envelope with malformed payload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn attempt_cap_is_inclusive() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2);
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(ReconnectPolicy::default().allows(u32::MAX));
        assert_eq!(ReconnectPolicy::default().delay, Duration::from_secs(5));
    }

    #[test_timeout::timeout]
    fn envelopes_are_split_by_consumer() {
        let registered = RelayEnvelope::Registered {
            user_id: "sun-star-3".into(),
        };
        assert_eq!(
            SignalingEvent::from_envelope(registered).unwrap(),
            SignalingEvent::Status(ConnectionStatus::Ready {
                identity: "sun-star-3".into()
            })
        );

        let offer = RelayEnvelope::Offer {
            from: "calm-ocean-7".into(),
            offer: json!({"type": "offer", "sdp": "v=0"}),
        };
        assert_eq!(
            SignalingEvent::from_envelope(offer).unwrap(),
            SignalingEvent::Call(CallSignal::Offer {
                from: "calm-ocean-7".into(),
                description: SessionDescription::offer("v=0"),
            })
        );

        let chat = RelayEnvelope::Message {
            from: "calm-ocean-7".into(),
            message: "hi".into(),
        };
        assert_eq!(
            SignalingEvent::from_envelope(chat).unwrap(),
            SignalingEvent::Chat {
                from: "calm-ocean-7".into(),
                text: "hi".into()
            }
        );
    }

    #[test_timeout::timeout]
    fn malformed_payloads_are_rejected() {
        let candidate = RelayEnvelope::Candidate {
            from: "calm-ocean-7".into(),
            candidate: json!({"sdpMid": "0"}),
        };
        assert!(SignalingEvent::from_envelope(candidate).is_err());
    }
}
