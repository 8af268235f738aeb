#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use callbox_client::signaling::{SignalSender, SignalingError};
use callbox_proto::{ClientEnvelope, EnvelopeKind};
use callbox_relay::{ConnectionRegistry, RelayState};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Outbound signaling that records envelopes instead of sending them.
#[derive(Default)]
pub struct RecordingSignals {
    sent: Mutex<Vec<ClientEnvelope>>,
    offline: AtomicBool,
}

impl RecordingSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientEnvelope> {
        self.sent.lock().clone()
    }

    pub fn count(&self, kind: EnvelopeKind) -> usize {
        self.sent.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl SignalSender for RecordingSignals {
    fn send_envelope(&self, envelope: ClientEnvelope) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}

/// Starts a relay on an ephemeral port and returns its address.
pub async fn spawn_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay listener");
    let addr = listener.local_addr().expect("relay addr");
    let state = RelayState::new(ConnectionRegistry::new());
    tokio::spawn(async move {
        callbox_relay::serve(listener, state)
            .await
            .expect("relay serve");
    });
    addr
}

/// Waits for the first item on `rx` that `pick` maps to `Some`.
pub async fn wait_for<T, R>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    mut pick: impl FnMut(&T) -> Option<R>,
) -> R {
    timeout(WAIT, async {
        loop {
            let item = rx.recv().await.expect("channel closed while waiting");
            if let Some(found) = pick(&item) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
