use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::signaling::{SignalSender, SignalingError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no remote peer selected; start a call or wait for a peer first")]
    NoRemote,
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub from: String,
    pub text: String,
    pub direction: Direction,
}

/// Messages shown to the user during this run. Nothing is persisted.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<ChatEntry>,
}

impl Transcript {
    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: ChatEntry) -> &ChatEntry {
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }
}

/// Sends chat text through the relay and records both directions.
///
/// There are no acknowledgements: a message to an identity that is not
/// connected is accepted here and dropped by the relay.
pub struct ChatRelay {
    signals: Arc<dyn SignalSender>,
    transcript: Transcript,
}

impl ChatRelay {
    pub fn new(signals: Arc<dyn SignalSender>) -> Self {
        Self {
            signals,
            transcript: Transcript::default(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn send(
        &mut self,
        local: &str,
        remote: Option<&str>,
        text: &str,
    ) -> Result<&ChatEntry, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let remote = remote.ok_or(ChatError::NoRemote)?;
        self.signals.send_chat(remote, text)?;
        debug!(to = %remote, "chat message sent");
        Ok(self.transcript.push(ChatEntry {
            from: local.to_string(),
            text: text.to_string(),
            direction: Direction::Outgoing,
        }))
    }

    pub fn receive(&mut self, from: &str, text: &str) -> &ChatEntry {
        debug!(from = %from, "chat message received");
        self.transcript.push(ChatEntry {
            from: from.to_string(),
            text: text.to_string(),
            direction: Direction::Incoming,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbox_proto::ClientEnvelope;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<ClientEnvelope>>,
        offline: bool,
    }

    impl SignalSender for Outbox {
        fn send_envelope(&self, envelope: ClientEnvelope) -> Result<(), SignalingError> {
            if self.offline {
                return Err(SignalingError::NotConnected);
            }
            self.sent.lock().push(envelope);
            Ok(())
        }
    }

    #[test_timeout::timeout]
    fn sent_messages_are_addressed_and_recorded() {
        let outbox = Arc::new(Outbox::default());
        let mut chat = ChatRelay::new(outbox.clone());

        let entry = chat
            .send("sun-star-3", Some("calm-ocean-7"), " hi ")
            .expect("message sent")
            .clone();
        assert_eq!(entry.text, "hi");
        assert_eq!(entry.direction, Direction::Outgoing);
        assert_eq!(
            outbox.sent.lock().as_slice(),
            &[ClientEnvelope::Message {
                target: "calm-ocean-7".into(),
                message: "hi".into()
            }]
        );
    }

    #[test_timeout::timeout]
    fn sending_requires_a_remote_and_text() {
        let outbox = Arc::new(Outbox::default());
        let mut chat = ChatRelay::new(outbox.clone());
        assert!(matches!(
            chat.send("sun-star-3", None, "hi"),
            Err(ChatError::NoRemote)
        ));
        assert!(matches!(
            chat.send("sun-star-3", Some("calm-ocean-7"), "   "),
            Err(ChatError::EmptyMessage)
        ));
        assert!(chat.transcript().is_empty());
        assert!(outbox.sent.lock().is_empty());
    }

    #[test_timeout::timeout]
    fn failed_sends_are_not_recorded() {
        let outbox = Arc::new(Outbox {
            offline: true,
            ..Default::default()
        });
        let mut chat = ChatRelay::new(outbox);
        assert!(matches!(
            chat.send("sun-star-3", Some("calm-ocean-7"), "hi"),
            Err(ChatError::Signaling(SignalingError::NotConnected))
        ));
        assert!(chat.transcript().is_empty());

        chat.receive("calm-ocean-7", "hello");
        assert_eq!(chat.transcript().len(), 1);
        assert_eq!(chat.transcript().entries()[0].direction, Direction::Incoming);
    }
}
