//! Offerer/answerer symmetry breaking
//!
//! The relay tells each participant whether it initiates. The assignment is
//! applied at most once per session; later role envelopes cannot change it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Negotiation role of the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No valid assignment received yet
    #[default]
    Unknown,
    /// Creates the offer once the peer is present
    Initiator,
    /// Answers the peer's offer
    Responder,
}

impl Role {
    /// Parse a relay role value; only `initiator` and `responder` are valid
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initiator" => Some(Role::Initiator),
            "responder" => Some(Role::Responder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unknown => "unknown",
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of offering a role value to the assigner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    /// The role was set by this call
    Assigned(Role),
    /// The value was not a valid role; nothing changed
    Invalid,
    /// A role was already set; nothing changed
    AlreadyAssigned(Role),
}

/// Write-once holder of the session's role
#[derive(Debug, Default)]
pub struct RoleAssigner {
    role: Role,
}

impl RoleAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_assigned(&self) -> bool {
        self.role != Role::Unknown
    }

    /// Apply a role envelope's value
    pub fn assign(&mut self, value: &str) -> RoleOutcome {
        if self.is_assigned() {
            warn!(
                "Ignoring role '{}': already assigned {}",
                value, self.role
            );
            return RoleOutcome::AlreadyAssigned(self.role);
        }

        match Role::parse(value) {
            Some(role) => {
                info!("Assigned role {}", role);
                self.role = role;
                RoleOutcome::Assigned(role)
            }
            None => {
                warn!("Discarding invalid role value '{}'", value);
                RoleOutcome::Invalid
            }
        }
    }
}
