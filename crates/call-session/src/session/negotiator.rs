//! Offer/answer state machine
//!
//! ```text
//! Uninitialized -> RolePending -> ConnectionReady -> Negotiating -> Active
//!        \______________\_______________\________________\__________\-> Ended
//! ```
//!
//! `RolePending` lasts until both a valid role and an ICE server config are
//! known. Every ICE server config after that builds a new connection
//! generation; a generation that fails to build drops back to
//! `RolePending` until the next config arrives. The initiator sends one offer per generation once the peer
//! is present; the responder answers the peer's offer. Remote candidates
//! go through the [`CandidateBuffer`] so none reaches the engine before the
//! remote description.
//!
//! Handlers record [`Progress`] as each step completes, so steps taken
//! before a failing engine call are still reported through
//! [`Negotiator::take_progress`].

use crate::engine::{ConnectionEvent, MediaEngine, PeerConnectionHandle};
use crate::media::capture::LocalMedia;
use crate::media::pipeline::{LayerParameterWriter, MediaPipelineConfigurator};
use crate::session::candidates::{CandidateBuffer, Enqueue};
use crate::session::role::{Role, RoleAssigner, RoleOutcome};
use crate::signaling::envelope::{
    CandidateDescriptor, IceServerConfig, OutboundEnvelope, SessionDescription,
};
use crate::signaling::transport::SignalingTransport;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Negotiation phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    Uninitialized,
    RolePending,
    ConnectionReady,
    Negotiating,
    Active,
    Ended,
}

impl NegotiationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationPhase::Ended)
    }
}

/// Something the negotiator accomplished while handling an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    RoleAssigned(Role),
    /// The connection of this generation was closed and replaced
    GenerationClosed(u64),
    GenerationStarted(u64),
    OfferSent(u64),
    AnswerSent(u64),
    /// The remote description was applied for this generation
    Active(u64),
}

/// Collaborators the negotiator drives
pub struct NegotiatorContext {
    pub engine: Arc<dyn MediaEngine>,
    pub configurator: MediaPipelineConfigurator,
    pub media: LocalMedia,
    pub transport: Arc<dyn SignalingTransport>,
    pub connection_events: mpsc::UnboundedSender<ConnectionEvent>,
}

struct GenerationState {
    id: u64,
    connection: Arc<dyn PeerConnectionHandle>,
    writer: Arc<LayerParameterWriter>,
    remote_description_applied: bool,
    offer_sent: bool,
}

/// Drives offer/answer exchange for one session
pub struct Negotiator {
    ctx: NegotiatorContext,
    phase: NegotiationPhase,
    roles: RoleAssigner,
    ice_config: Option<IceServerConfig>,
    next_generation: u64,
    current: Option<GenerationState>,
    candidates: CandidateBuffer,
    /// Offer that arrived before the generation existed
    pending_offer: Option<SessionDescription>,
    peer_present: bool,
    progress: Vec<Progress>,
}

impl Negotiator {
    /// # Arguments
    ///
    /// * `ctx` - Engine, media, transport and event sink
    /// * `max_pending_candidates` - Candidate buffer capacity
    pub fn new(ctx: NegotiatorContext, max_pending_candidates: usize) -> Self {
        Self {
            ctx,
            phase: NegotiationPhase::Uninitialized,
            roles: RoleAssigner::new(),
            ice_config: None,
            next_generation: 1,
            current: None,
            candidates: CandidateBuffer::new(max_pending_candidates),
            pending_offer: None,
            peer_present: false,
            progress: Vec::new(),
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.roles.role()
    }

    /// Current generation id, if a connection exists
    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|g| g.id)
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnectionHandle>> {
        self.current.as_ref().map(|g| Arc::clone(&g.connection))
    }

    pub fn writer(&self) -> Option<Arc<LayerParameterWriter>> {
        self.current.as_ref().map(|g| Arc::clone(&g.writer))
    }

    pub fn remote_description_applied(&self) -> bool {
        self.current
            .as_ref()
            .map(|g| g.remote_description_applied)
            .unwrap_or(false)
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Remote candidates discarded by the full buffer for the current generation
    pub fn dropped_candidates(&self) -> usize {
        self.candidates.dropped()
    }

    /// Drain the progress recorded since the last call
    pub fn take_progress(&mut self) -> Vec<Progress> {
        std::mem::take(&mut self.progress)
    }

    pub fn media(&self) -> &LocalMedia {
        &self.ctx.media
    }

    /// Capture and transport are up; wait for role and ICE config
    pub fn start(&mut self) {
        if self.phase == NegotiationPhase::Uninitialized {
            self.set_phase(NegotiationPhase::RolePending);
        }
    }

    fn set_phase(&mut self, phase: NegotiationPhase) {
        if self.phase != phase {
            debug!("Negotiation phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn ensure_live(&self, what: &str) -> Result<()> {
        match self.phase {
            NegotiationPhase::Ended => Err(Error::SessionEnded(format!("{} after termination", what))),
            NegotiationPhase::Uninitialized => {
                Err(Error::UnexpectedSignal(format!("{} before session start", what)))
            }
            _ => Ok(()),
        }
    }

    /// Apply a `role` envelope
    pub async fn handle_role(&mut self, value: &str) -> Result<()> {
        self.ensure_live("role")?;

        match self.roles.assign(value) {
            RoleOutcome::Assigned(role) => self.progress.push(Progress::RoleAssigned(role)),
            RoleOutcome::Invalid | RoleOutcome::AlreadyAssigned(_) => return Ok(()),
        }

        if self.current.is_none() {
            if let Some(ice) = self.ice_config.clone() {
                self.start_generation(ice).await?;
            }
        }

        Ok(())
    }

    /// Apply an `ice_server_config` envelope
    pub async fn handle_ice_config(&mut self, ice: IceServerConfig) -> Result<()> {
        self.ensure_live("ice_server_config")?;

        self.ice_config = Some(ice.clone());

        if !self.roles.is_assigned() {
            debug!("ICE config stored until a role is assigned");
            return Ok(());
        }

        self.start_generation(ice).await
    }

    /// Build a new generation, replacing the current one
    async fn start_generation(&mut self, ice: IceServerConfig) -> Result<()> {
        if let Some(previous) = self.current.take() {
            info!("Replacing connection generation {}", previous.id);
            if let Err(e) = previous.connection.close().await {
                warn!("Failed to close generation {}: {}", previous.id, e);
            }
            if self.candidates.dropped() > 0 {
                warn!(
                    "Generation {} discarded {} remote candidates on a full buffer",
                    previous.id,
                    self.candidates.dropped()
                );
            }
            self.candidates.reset();
            self.progress.push(Progress::GenerationClosed(previous.id));
        }

        let id = self.next_generation;
        self.next_generation += 1;

        let built = self
            .ctx
            .configurator
            .build(
                self.ctx.engine.as_ref(),
                id,
                &ice,
                &self.ctx.media,
                self.ctx.connection_events.clone(),
            )
            .await;
        let configured = match built {
            Ok(configured) => configured,
            Err(e) => {
                warn!("Generation {} could not be built: {}", id, e);
                self.set_phase(NegotiationPhase::RolePending);
                return Err(e);
            }
        };

        self.current = Some(GenerationState {
            id,
            connection: configured.connection,
            writer: configured.writer,
            remote_description_applied: false,
            offer_sent: false,
        });
        self.set_phase(NegotiationPhase::ConnectionReady);
        self.progress.push(Progress::GenerationStarted(id));

        info!(
            "Generation {} ready as {} ({} candidates waiting)",
            id,
            self.roles.role(),
            self.candidates.len()
        );

        match self.roles.role() {
            Role::Initiator if self.peer_present => {
                self.send_offer().await?;
            }
            Role::Responder => {
                if let Some(offer) = self.pending_offer.take() {
                    debug!("Replaying offer received before generation {}", id);
                    self.apply_offer(offer).await?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Apply a `peer_joined` envelope
    pub async fn handle_peer_joined(&mut self) -> Result<()> {
        self.ensure_live("peer_joined")?;

        self.peer_present = true;

        if self.roles.role() != Role::Initiator {
            return Ok(());
        }

        match &self.current {
            None => debug!("Peer joined before the connection exists; offer deferred"),
            Some(generation) if generation.offer_sent => {
                debug!(
                    "Offer already sent for generation {}; ignoring peer_joined",
                    generation.id
                );
            }
            Some(_) => self.send_offer().await?,
        }

        Ok(())
    }

    async fn send_offer(&mut self) -> Result<()> {
        let Some(generation) = self.current.as_mut() else {
            return Ok(());
        };
        if generation.offer_sent {
            return Ok(());
        }

        // Marked before the engine call so a failure cannot lead to a second offer
        generation.offer_sent = true;
        let id = generation.id;
        let offer = generation.connection.create_offer().await?;

        self.ctx
            .transport
            .send(OutboundEnvelope::Offer { data: offer });
        self.set_phase(NegotiationPhase::Negotiating);
        self.progress.push(Progress::OfferSent(id));
        info!("Sent offer for generation {}", id);
        Ok(())
    }

    /// Apply an `offer` envelope
    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<()> {
        self.ensure_live("offer")?;

        match self.roles.role() {
            Role::Initiator => {
                return Err(Error::UnexpectedSignal(
                    "offer received while acting as initiator".to_string(),
                ))
            }
            Role::Unknown => {
                self.hold_offer(offer);
                return Ok(());
            }
            Role::Responder => {}
        }

        if self.current.is_none() {
            self.hold_offer(offer);
            return Ok(());
        }

        self.apply_offer(offer).await
    }

    fn hold_offer(&mut self, offer: SessionDescription) {
        if self.pending_offer.replace(offer).is_some() {
            warn!("Replacing an earlier offer held before the connection existed");
        } else {
            debug!("Holding offer until the connection exists");
        }
    }

    /// A rejected offer leaves the phase untouched
    async fn apply_offer(&mut self, offer: SessionDescription) -> Result<()> {
        let Some(generation) = self.current.as_mut() else {
            return Ok(());
        };
        if generation.remote_description_applied {
            return Err(Error::UnexpectedSignal(format!(
                "second offer for generation {}",
                generation.id
            )));
        }

        let id = generation.id;
        let connection = Arc::clone(&generation.connection);

        connection.set_remote_description(&offer).await?;
        self.mark_remote_applied(connection.as_ref()).await;
        self.progress.push(Progress::Active(id));

        let answer = connection.create_answer().await?;
        self.ctx
            .transport
            .send(OutboundEnvelope::Answer { data: answer });
        self.progress.push(Progress::AnswerSent(id));
        info!("Answered offer for generation {}", id);
        Ok(())
    }

    /// Apply an `answer` envelope
    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.ensure_live("answer")?;

        if self.roles.role() != Role::Initiator {
            return Err(Error::UnexpectedSignal(format!(
                "answer received while role is {}",
                self.roles.role()
            )));
        }

        let Some(generation) = self.current.as_ref() else {
            return Err(Error::UnexpectedSignal(
                "answer received before any connection".to_string(),
            ));
        };
        if !generation.offer_sent {
            return Err(Error::UnexpectedSignal(format!(
                "answer received before offer for generation {}",
                generation.id
            )));
        }
        if generation.remote_description_applied {
            return Err(Error::UnexpectedSignal(format!(
                "duplicate answer for generation {}",
                generation.id
            )));
        }

        let id = generation.id;
        let connection = Arc::clone(&generation.connection);

        connection.set_remote_description(&answer).await?;
        self.mark_remote_applied(connection.as_ref()).await;

        self.progress.push(Progress::Active(id));
        info!("Applied answer for generation {}", id);
        Ok(())
    }

    /// The single `remote_description_applied` transition
    async fn mark_remote_applied(&mut self, connection: &dyn PeerConnectionHandle) {
        if let Some(generation) = self.current.as_mut() {
            generation.remote_description_applied = true;
        }
        self.candidates.flush_into(connection).await;
        self.set_phase(NegotiationPhase::Active);
    }

    /// Apply a remote `candidate` envelope
    pub async fn handle_remote_candidate(&mut self, candidate: CandidateDescriptor) -> Result<()> {
        self.ensure_live("candidate")?;

        match self.candidates.enqueue(candidate) {
            Enqueue::Buffered => {
                debug!("Buffered remote candidate ({} waiting)", self.candidates.len());
                Ok(())
            }
            Enqueue::Dropped => Ok(()),
            Enqueue::ApplyNow(candidate) => match &self.current {
                Some(generation) => generation.connection.add_ice_candidate(&candidate).await,
                None => Err(Error::UnexpectedSignal(
                    "candidate with no connection".to_string(),
                )),
            },
        }
    }

    /// Forward a locally gathered candidate if it belongs to the current generation
    ///
    /// Returns whether it was sent.
    pub fn handle_local_candidate(&self, generation: u64, candidate: CandidateDescriptor) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        match &self.current {
            Some(current) if current.id == generation => {
                self.ctx
                    .transport
                    .send(OutboundEnvelope::Candidate { data: candidate });
                true
            }
            _ => {
                debug!("Dropping local candidate from stale generation {}", generation);
                false
            }
        }
    }

    /// Close the connection and clear negotiation state; idempotent
    ///
    /// Returns `false` if the negotiator had already shut down.
    pub async fn shutdown(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.set_phase(NegotiationPhase::Ended);

        if let Some(generation) = self.current.take() {
            if let Err(e) = generation.connection.close().await {
                warn!("Failed to close generation {}: {}", generation.id, e);
            }
        }

        self.candidates.clear();
        self.pending_offer = None;
        self.peer_present = false;
        true
    }
}
