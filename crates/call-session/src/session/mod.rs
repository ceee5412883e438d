//! Call session: role assignment, negotiation and lifecycle
//!
//! [`CallSession`] owns all mutable session state and processes one
//! [`SessionEvent`] at a time. Applications interact with a running session
//! through a [`SessionHandle`] and receive notifications on a
//! [`SessionObserver`].

pub mod candidates;
pub mod handle;
pub mod lifecycle;
pub mod negotiator;
pub mod role;

pub use candidates::{CandidateBuffer, Enqueue, FlushReport};
pub use handle::SessionHandle;
pub use lifecycle::{CallSession, SessionCommand, SessionEvent};
pub use negotiator::{NegotiationPhase, Negotiator, NegotiatorContext, Progress};
pub use role::{Role, RoleAssigner, RoleOutcome};

use crate::engine::RemoteTrack;
use crate::media::capture::LocalTrack;
use crate::signaling::envelope::ChatMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signaling connection status
///
/// `Disconnected` is terminal for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Why the local participant ended the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    Skipped,
    Blocked,
}

impl EndReason {
    /// Value sent in the `end_session` envelope
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserEnded => "user_ended",
            EndReason::Skipped => "skipped",
            EndReason::Blocked => "blocked",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Ended by the local participant
    Local(EndReason),
    /// The other participant left
    PeerLeft,
    /// The relay ended the session
    RemoteTerminated(Option<String>),
    /// The signaling channel failed before media was flowing
    TransportLost(String),
    /// No remote description within the configured timeout
    NegotiationTimeout,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Local(reason) => write!(f, "ended locally ({})", reason),
            TerminationReason::PeerLeft => f.write_str("peer left"),
            TerminationReason::RemoteTerminated(Some(reason)) => {
                write!(f, "terminated by relay ({})", reason)
            }
            TerminationReason::RemoteTerminated(None) => f.write_str("terminated by relay"),
            TerminationReason::TransportLost(msg) => write!(f, "signaling lost: {}", msg),
            TerminationReason::NegotiationTimeout => f.write_str("negotiation timed out"),
        }
    }
}

/// Application callbacks; every method defaults to a no-op
///
/// Callbacks run on the session task and must not block.
pub trait SessionObserver: Send + Sync {
    fn on_status_changed(&self, _status: ConnectionStatus) {}

    fn on_role_assigned(&self, _role: Role) {}

    /// A local capture track can be shown as a self-view
    fn on_local_track_ready(&self, _track: &LocalTrack) {}

    /// A remote track arrived on the current connection
    fn on_remote_track_ready(&self, _track: &RemoteTrack) {}

    fn on_chat_message(&self, _message: &ChatMessage) {}

    /// Invoked exactly once per session
    fn on_terminated(&self, _reason: &TerminationReason) {}
}

/// Observer that ignores every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}
