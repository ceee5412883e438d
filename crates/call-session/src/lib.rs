//! Client-side call session negotiation for one-to-one video chat
//!
//! This crate drives a single call between two matched participants: it
//! talks to a signaling relay over WebSocket, decides who offers, exchanges
//! SDP and ICE candidates, sends local media as three simulcast video
//! encodings, and adapts those encodings' bitrate caps to network quality.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Application (SessionObserver / SessionHandle)         │
//! │  ↓                                                     │
//! │  CallSession (single event loop)                       │
//! │  ├─ SignalingTransport (JSON envelopes over WebSocket) │
//! │  ├─ Negotiator                                         │
//! │  │   ├─ RoleAssigner (initiator / responder)           │
//! │  │   └─ CandidateBuffer (held until remote SDP)        │
//! │  ├─ MediaPipelineConfigurator (per generation)         │
//! │  │   └─ LayerParameterWriter (simulcast caps)          │
//! │  └─ AdaptiveBitrateController (periodic stats tick)    │
//! │     ↓                                                  │
//! │  MediaEngine (webrtc-rs peer connections)              │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use remotemedia_call_session::CallSessionConfig;
//!
//! let config = CallSessionConfig::new("wss://relay.example.com");
//! assert!(config.validate().is_ok());
//! assert_eq!(config.adaptation.interval_ms, 3000);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use remotemedia_call_session::{
//!     CallSession, CallSessionConfig, NoopObserver, SessionCredentials, SyntheticCapture,
//!     WebRtcEngine, WebSocketConnector,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> remotemedia_call_session::Result<()> {
//! let session = CallSession::start(
//!     CallSessionConfig::new("wss://relay.example.com"),
//!     SessionCredentials::new("session-123", "token"),
//!     &SyntheticCapture::new(),
//!     Arc::new(WebRtcEngine::new()),
//!     &WebSocketConnector::default(),
//!     Arc::new(NoopObserver),
//! )
//! .await?;
//!
//! let handle = session.handle();
//! let reason = session.run().await;
//! println!("call ended: {} ({:?})", reason, handle.status());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod adaptation;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use adaptation::{
    AdaptationThresholds, AdaptiveBitrateController, BitrateDecision, LossMeasure, NetworkSample,
};
pub use config::{AdaptationConfig, CallSessionConfig};
pub use engine::{MediaEngine, PeerConnectionHandle, PeerState, RemoteTrack, WebRtcEngine};
pub use error::{Error, Result};
pub use media::{
    BitratePreset, CaptureConstraints, CaptureError, CaptureSource, LayerId, LocalMedia,
    LocalTrack, MediaKind, SimulcastLayers, SyntheticCapture,
};
pub use session::{
    CallSession, ConnectionStatus, EndReason, NegotiationPhase, NoopObserver, Role,
    SessionHandle, SessionObserver, TerminationReason,
};
pub use signaling::{
    ChatMessage, IceServerConfig, SessionCredentials, SignalEnvelope, SignalingConnector,
    WebSocketConnector,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
