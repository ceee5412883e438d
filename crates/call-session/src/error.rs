//! Error types for call session negotiation

use crate::media::capture::CaptureError;

/// Result type alias using the call session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a call session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel error (open failure, channel closed)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Envelope could not be decoded
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),

    /// Envelope arrived that the current role or phase does not expect
    #[error("Unexpected signal: {0}")]
    UnexpectedSignal(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// The engine refused multi-layer encoding for a sender
    #[error("Simulcast rejected: {0}")]
    SimulcastRejected(String),

    /// Transport statistics could not be read
    #[error("Statistics unavailable: {0}")]
    StatsUnavailable(String),

    /// Local capture could not be acquired
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    /// Operation attempted on a session that has already ended
    #[error("Session ended: {0}")]
    SessionEnded(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::WebSocketError(_) | Error::StatsUnavailable(_)
        )
    }

    /// Check if this error concerns the signaling channel or its payloads
    pub fn is_signaling_error(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::MalformedSignal(_)
                | Error::UnexpectedSignal(_)
        )
    }

    /// Check if this error was raised by the engine during offer/answer
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::SdpError(_) | Error::IceCandidateError(_) | Error::PeerConnectionError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
