pub mod call;
pub mod chat;
pub mod config;
pub mod identity;
pub mod logging;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use call::{
    CallError, CallEvent, CallNegotiator, CallPhase, CallState, CandidatePolicy, EndReason,
};
pub use chat::{ChatEntry, ChatError, ChatRelay, Direction, Transcript};
pub use config::{ClientArgs, ClientConfig};
pub use session::{ClientSession, SessionCommand, SessionEvent, SessionHandle};
pub use signaling::{
    ConnectionStatus, ReconnectPolicy, SignalSender, SignalingClient, SignalingError,
};
