//! Media engine seam
//!
//! The session never talks to a WebRTC stack directly. It asks a
//! [`MediaEngine`] for one [`PeerConnectionHandle`] per connection
//! generation and receives the engine's asynchronous output (local
//! candidates, remote tracks, state changes) as [`ConnectionEvent`]s tagged
//! with that generation, so events from a replaced connection can be
//! recognised and dropped.

pub mod webrtc;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use crate::adaptation::NetworkSample;
use crate::media::capture::{LocalTrack, MediaKind};
use crate::media::layers::SimulcastLayers;
use crate::signaling::envelope::{CandidateDescriptor, IceServerConfig, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use self::webrtc::WebRtcEngine;

/// Transport-level state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A media track received from the remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Engine-specific track object for the presentation layer
    pub source: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    /// A local ICE candidate to trickle to the peer
    LocalCandidate(CandidateDescriptor),
    RemoteTrack(RemoteTrack),
    StateChanged(PeerState),
}

/// Engine output tagged with the generation that produced it
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

/// Factory for peer connections
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create the peer connection for one generation
    ///
    /// # Arguments
    ///
    /// * `generation` - Generation id stamped on every emitted event
    /// * `ice` - STUN/TURN servers supplied by the relay
    /// * `events` - Sink for asynchronous connection output
    async fn create_connection(
        &self,
        generation: u64,
        ice: &IceServerConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>>;
}

/// One peer connection
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    fn generation(&self) -> u64;

    /// Send a local track as a single encoding
    async fn attach_track(&self, track: &LocalTrack) -> Result<()>;

    /// Send a local video track as three simulcast encodings
    ///
    /// Fails with `SimulcastRejected` when the engine cannot carry multiple
    /// encodings; in that case nothing has been attached.
    async fn attach_simulcast_track(&self, track: &LocalTrack, layers: &SimulcastLayers)
        -> Result<()>;

    /// Rewrite the per-layer bitrate caps of the video sender
    async fn apply_encoding_parameters(&self, layers: &SimulcastLayers) -> Result<()>;

    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &CandidateDescriptor) -> Result<()>;

    /// Sample outbound video statistics; `None` while nothing has been sent
    async fn outbound_video_stats(&self) -> Result<Option<NetworkSample>>;

    async fn close(&self) -> Result<()>;
}
