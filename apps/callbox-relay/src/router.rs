use callbox_proto::{ClientEnvelope, EnvelopeError, EnvelopeKind, RelayEnvelope};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{ConnectionRegistry, RelayConnection};

/// Per-socket routing state, owned by the socket's reader task.
pub struct ConnectionContext {
    connection: RelayConnection,
    identity: Option<String>,
}

impl ConnectionContext {
    pub fn new(connection: RelayConnection) -> Self {
        Self {
            connection,
            identity: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.connection.id()
    }

    /// Identity this socket most recently registered, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The sender has not registered an identity yet.
    SenderUnregistered,
    TargetUnknown,
    TargetClosed,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::SenderUnregistered => "sender_unregistered",
            DropReason::TargetUnknown => "target_unknown",
            DropReason::TargetClosed => "target_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Registered { identity: String, superseded: bool },
    Forwarded { kind: EnvelopeKind, target: String },
    Dropped { kind: EnvelopeKind, reason: DropReason },
}

/// Validates inbound envelopes and forwards them between registered identities.
///
/// Routing never reports delivery failures back to the sender: an envelope
/// for an unknown or closed target is dropped and only shows up in logs and
/// the `callbox_relay_envelopes_dropped_total` counter.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Parses one text frame and routes it.
    pub fn route_text(
        &self,
        sender: &mut ConnectionContext,
        text: &str,
    ) -> Result<RouteOutcome, EnvelopeError> {
        let envelope = ClientEnvelope::parse(text)?;
        Ok(self.route(sender, envelope))
    }

    pub fn route(&self, sender: &mut ConnectionContext, envelope: ClientEnvelope) -> RouteOutcome {
        let kind = envelope.kind();
        match envelope {
            ClientEnvelope::Register { user_id } => self.register(sender, user_id),
            forwardable => self.forward(sender, kind, forwardable),
        }
    }

    fn register(&self, sender: &mut ConnectionContext, identity: String) -> RouteOutcome {
        // A socket that switches identity gives up its previous binding.
        if let Some(previous) = sender.identity.take() {
            if previous != identity && self.registry.remove(&previous, sender.id()) {
                debug!(identity = %previous, connection_id = %sender.id(), "released previous identity");
            }
        }

        let superseded = self
            .registry
            .register(&identity, sender.connection.clone())
            .is_some_and(|old| old.id() != sender.id());
        sender.identity = Some(identity.clone());

        info!(
            identity = %identity,
            connection_id = %sender.id(),
            superseded,
            "identity registered"
        );
        gauge!("callbox_relay_registered_identities", self.registry.len() as f64);

        if let Err(err) = sender.connection.deliver(RelayEnvelope::Registered {
            user_id: identity.clone(),
        }) {
            warn!(error = %err, "failed to acknowledge registration");
        }

        RouteOutcome::Registered {
            identity,
            superseded,
        }
    }

    fn forward(
        &self,
        sender: &ConnectionContext,
        kind: EnvelopeKind,
        envelope: ClientEnvelope,
    ) -> RouteOutcome {
        let Some(from) = sender.identity.as_deref() else {
            return self.dropped(kind, None, DropReason::SenderUnregistered);
        };
        let Some(target) = envelope.target().map(str::to_string) else {
            return self.dropped(kind, None, DropReason::TargetUnknown);
        };

        let Some(connection) = self.registry.lookup(&target) else {
            return self.dropped(kind, Some(&target), DropReason::TargetUnknown);
        };
        if !connection.is_open() {
            return self.dropped(kind, Some(&target), DropReason::TargetClosed);
        }

        let Some(relayed) = envelope.relayed_from(from) else {
            return self.dropped(kind, Some(&target), DropReason::TargetUnknown);
        };
        if connection.deliver(relayed).is_err() {
            return self.dropped(kind, Some(&target), DropReason::TargetClosed);
        }

        debug!(kind = %kind, from = %from, to = %target, "envelope forwarded");
        counter!("callbox_relay_envelopes_forwarded_total", 1, "type" => kind.as_str());
        RouteOutcome::Forwarded { kind, target }
    }

    fn dropped(&self, kind: EnvelopeKind, target: Option<&str>, reason: DropReason) -> RouteOutcome {
        debug!(kind = %kind, to = ?target, reason = reason.as_str(), "envelope dropped");
        counter!(
            "callbox_relay_envelopes_dropped_total",
            1,
            "type" => kind.as_str(),
            "reason" => reason.as_str()
        );
        RouteOutcome::Dropped { kind, reason }
    }

    /// Releases the socket's binding when its transport closes.
    pub fn disconnect(&self, sender: &ConnectionContext) {
        if let Some(identity) = sender.identity() {
            if self.registry.remove(identity, sender.id()) {
                info!(identity = %identity, connection_id = %sender.id(), "identity disconnected");
            }
        }
        gauge!("callbox_relay_registered_identities", self.registry.len() as f64);
    }
}
