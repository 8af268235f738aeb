//! Wire envelopes exchanged between callbox clients and the relay.
//! Every frame is one JSON object discriminated by its `type` field. Keeping
//! the vocabulary in its own crate lets the relay stay free of any media stack.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope types a client may send to the relay.
pub const CLIENT_ENVELOPE_TYPES: [&str; 5] = ["register", "offer", "answer", "candidate", "message"];

/// Envelope types the relay may deliver to a client.
pub const RELAY_ENVELOPE_TYPES: [&str; 5] =
    ["registered", "offer", "answer", "candidate", "message"];

/// Messages sent from a client to the relay.
///
/// Payloads of `offer`, `answer` and `candidate` are kept as raw JSON so the
/// relay forwards them byte-for-byte in meaning without interpreting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Bind the sending connection to an identity.
    Register {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Offer {
        target: String,
        offer: Value,
    },
    Answer {
        target: String,
        answer: Value,
    },
    Candidate {
        target: String,
        candidate: Value,
    },
    /// Free chat text.
    Message {
        target: String,
        message: String,
    },
}

/// Messages delivered by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEnvelope {
    /// Acknowledges a `register` with the identity that was bound.
    Registered {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Offer {
        from: String,
        offer: Value,
    },
    Answer {
        from: String,
        answer: Value,
    },
    Candidate {
        from: String,
        candidate: Value,
    },
    Message {
        from: String,
        message: String,
    },
}

/// Discriminant of an envelope, used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Register,
    Registered,
    Offer,
    Answer,
    Candidate,
    Message,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Register => "register",
            EnvelopeKind::Registered => "registered",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::Message => "message",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has no type field")]
    MissingType,
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
}

impl ClientEnvelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        parse_tagged(text, &CLIENT_ENVELOPE_TYPES)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            ClientEnvelope::Register { .. } => EnvelopeKind::Register,
            ClientEnvelope::Offer { .. } => EnvelopeKind::Offer,
            ClientEnvelope::Answer { .. } => EnvelopeKind::Answer,
            ClientEnvelope::Candidate { .. } => EnvelopeKind::Candidate,
            ClientEnvelope::Message { .. } => EnvelopeKind::Message,
        }
    }

    /// Identity the envelope is addressed to. `register` has none.
    pub fn target(&self) -> Option<&str> {
        match self {
            ClientEnvelope::Register { .. } => None,
            ClientEnvelope::Offer { target, .. }
            | ClientEnvelope::Answer { target, .. }
            | ClientEnvelope::Candidate { target, .. }
            | ClientEnvelope::Message { target, .. } => Some(target),
        }
    }

    /// Builds the copy delivered to the target, stamped with the sender's
    /// registered identity. The payload is moved across untouched.
    ///
    /// Returns `None` for `register`, which is never forwarded.
    pub fn relayed_from(self, from: &str) -> Option<RelayEnvelope> {
        let from = from.to_string();
        match self {
            ClientEnvelope::Register { .. } => None,
            ClientEnvelope::Offer { offer, .. } => Some(RelayEnvelope::Offer { from, offer }),
            ClientEnvelope::Answer { answer, .. } => Some(RelayEnvelope::Answer { from, answer }),
            ClientEnvelope::Candidate { candidate, .. } => {
                Some(RelayEnvelope::Candidate { from, candidate })
            }
            ClientEnvelope::Message { message, .. } => {
                Some(RelayEnvelope::Message { from, message })
            }
        }
    }
}

impl RelayEnvelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        parse_tagged(text, &RELAY_ENVELOPE_TYPES)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            RelayEnvelope::Registered { .. } => EnvelopeKind::Registered,
            RelayEnvelope::Offer { .. } => EnvelopeKind::Offer,
            RelayEnvelope::Answer { .. } => EnvelopeKind::Answer,
            RelayEnvelope::Candidate { .. } => EnvelopeKind::Candidate,
            RelayEnvelope::Message { .. } => EnvelopeKind::Message,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn parse_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, EnvelopeError> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("type").and_then(Value::as_str) {
        None => return Err(EnvelopeError::MissingType),
        Some(kind) if !known.contains(&kind) => {
            return Err(EnvelopeError::UnknownType(kind.to_string()))
        }
        Some(_) => {}
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the browser's JSON shape: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn register_uses_camel_case_user_id() {
        let envelope = ClientEnvelope::parse(r#"{"type":"register","userId":"sun-star-3"}"#)
            .expect("register parses");
        assert_eq!(
            envelope,
            ClientEnvelope::Register {
                user_id: "sun-star-3".into()
            }
        );

        let ack = RelayEnvelope::Registered {
            user_id: "sun-star-3".into(),
        };
        let json: Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "registered", "userId": "sun-star-3"}));
    }

    #[test_timeout::timeout]
    fn unknown_and_malformed_frames_are_distinguished() {
        assert!(matches!(
            ClientEnvelope::parse(r#"{"type":"hello","target":"x"}"#),
            Err(EnvelopeError::UnknownType(kind)) if kind == "hello"
        ));
        assert!(matches!(
            ClientEnvelope::parse("not json"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            ClientEnvelope::parse(r#"{"target":"x"}"#),
            Err(EnvelopeError::MissingType)
        ));
        // Known type with a missing field is malformed, not unknown.
        assert!(matches!(
            ClientEnvelope::parse(r#"{"type":"offer","offer":{}}"#),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test_timeout::timeout]
    fn relayed_copy_stamps_sender_and_keeps_payload() {
        let payload = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2, 3]});
        let inbound = ClientEnvelope::parse(
            &json!({
                "type": "offer",
                "target": "calm-ocean-7",
                "from": "mallory",
                "offer": payload.clone(),
            })
            .to_string(),
        )
        .expect("offer parses");

        let relayed = inbound.relayed_from("sun-star-3").expect("offer is forwarded");
        assert_eq!(
            relayed,
            RelayEnvelope::Offer {
                from: "sun-star-3".into(),
                offer: payload,
            }
        );
    }

    #[test_timeout::timeout]
    fn register_is_never_relayed() {
        let register = ClientEnvelope::Register {
            user_id: "a".into(),
        };
        assert_eq!(register.target(), None);
        assert!(register.relayed_from("a").is_none());
    }

    #[test_timeout::timeout]
    fn payload_types_match_browser_shapes() {
        let description = SessionDescription::answer("v=0");
        assert_eq!(
            description.to_value().unwrap(),
            json!({"type": "answer", "sdp": "v=0"})
        );

        let candidate = IceCandidate::from_value(&json!({
            "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        }))
        .expect("candidate parses");
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.to_value().unwrap().get("usernameFragment").is_none());
    }
}
