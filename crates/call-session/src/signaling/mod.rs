//! Signaling relay client
//!
//! The relay only forwards signaling: role assignment, ICE server
//! configuration, presence, session descriptions, candidates and chat.
//! Media never passes through it.

pub mod envelope;
pub mod transport;
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use envelope::{
    CandidateDescriptor, ChatMessage, IceServerConfig, OutboundEnvelope, SdpKind,
    SessionDescription, SignalEnvelope,
};
pub use transport::{
    SessionCredentials, SignalingChannel, SignalingConnector, SignalingTransport, TransportEvent,
};
pub use websocket::{WebSocketConnector, WebSocketSignaling};
