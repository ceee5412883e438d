//! Cloneable control handle for a running session

use crate::session::lifecycle::{SessionCommand, SessionEvent};
use crate::session::negotiator::NegotiationPhase;
use crate::session::{ConnectionStatus, EndReason};
use tokio::sync::{mpsc, watch};

/// Lets other tasks end the session, send chat and observe its state
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<ConnectionStatus>,
    phase: watch::Receiver<NegotiationPhase>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<SessionEvent>,
        status: watch::Receiver<ConnectionStatus>,
        phase: watch::Receiver<NegotiationPhase>,
    ) -> Self {
        Self {
            commands,
            status,
            phase,
        }
    }

    /// Ask the session to end; `false` if the session is already gone
    pub fn end(&self, reason: EndReason) -> bool {
        self.send(SessionCommand::End(reason))
    }

    /// Send a chat line through the relay
    pub fn send_chat(&self, content: impl Into<String>) -> bool {
        self.send(SessionCommand::SendChat(content.into()))
    }

    fn send(&self, command: SessionCommand) -> bool {
        if self.is_ended() {
            return false;
        }
        self.commands.send(SessionEvent::Command(command)).is_ok()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.phase.borrow()
    }

    pub fn is_ended(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Subscribe to status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the session has ended
    pub async fn ended(&self) {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|p| p.is_terminal()).await;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("status", &self.status())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_rejected_after_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let (phase_tx, phase_rx) = watch::channel(NegotiationPhase::Active);
        let handle = SessionHandle::new(tx, status_rx, phase_rx);

        assert!(handle.send_chat("hi"));
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Command(SessionCommand::SendChat(ref s))) if s == "hi"
        ));

        phase_tx.send_replace(NegotiationPhase::Ended);
        assert!(handle.is_ended());
        assert!(!handle.end(EndReason::Skipped));
        assert!(rx.try_recv().is_err());
    }
}
