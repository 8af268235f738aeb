//! Identity to connection bindings for the relay.
//!
//! The registry is shared by every socket task. All access goes through the
//! methods below, each of which is a single operation on a sharded `DashMap`
//! (one shard lock held for the duration of that call, never across an
//! `.await`). Lookups hand out cloned [`RelayConnection`] handles so callers
//! never hold a map guard while forwarding.

use std::sync::Arc;

use callbox_proto::RelayEnvelope;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay connection {0} is closed")]
    ConnectionClosed(Uuid),
}

/// Outbound half of one accepted WebSocket.
///
/// The socket's writer task owns the receiving end; once it exits the handle
/// reports closed and any further delivery fails.
#[derive(Clone, Debug)]
pub struct RelayConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<RelayEnvelope>,
}

impl RelayConnection {
    pub fn new(tx: mpsc::UnboundedSender<RelayEnvelope>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn deliver(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
        self.tx
            .send(envelope)
            .map_err(|_| RelayError::ConnectionClosed(self.id))
    }
}

/// Maps an identity to the connection that most recently registered it.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, RelayConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` to `connection`, returning the connection it replaced.
    ///
    /// A replaced connection is neither notified nor closed; it stays on the
    /// wire but nothing routes to it any more.
    pub fn register(&self, identity: &str, connection: RelayConnection) -> Option<RelayConnection> {
        self.connections.insert(identity.to_string(), connection)
    }

    pub fn lookup(&self, identity: &str) -> Option<RelayConnection> {
        self.connections
            .get(identity)
            .map(|entry| entry.value().clone())
    }

    /// Drops the binding for `identity` if it still belongs to `connection_id`.
    ///
    /// A connection that was superseded by a newer registration must not
    /// unbind its successor when it closes, so the removal is conditional.
    /// Returns whether anything was removed.
    pub fn remove(&self, identity: &str, connection_id: Uuid) -> bool {
        self.connections
            .remove_if(identity, |_, connection| connection.id == connection_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
