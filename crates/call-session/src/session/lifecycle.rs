//! Session driver and teardown
//!
//! `CallSession::start` acquires capture and opens the signaling channel;
//! `run` then multiplexes transport events, engine events and internal
//! events (adaptation ticks, negotiation deadlines, handle commands) into
//! [`CallSession::handle_event`], one at a time. `terminate` releases
//! everything exactly once, after which every event is ignored.

use crate::adaptation::{AdaptationTicker, AdaptiveBitrateController};
use crate::config::CallSessionConfig;
use crate::engine::{ConnectionEvent, ConnectionEventKind, MediaEngine, PeerState};
use crate::media::capture::{CaptureSource, LocalMedia};
use crate::media::pipeline::MediaPipelineConfigurator;
use crate::session::handle::SessionHandle;
use crate::session::negotiator::{NegotiationPhase, Negotiator, NegotiatorContext, Progress};
use crate::session::{
    ConnectionStatus, EndReason, Role, SessionObserver, TerminationReason,
};
use crate::signaling::envelope::{OutboundEnvelope, SignalEnvelope};
use crate::signaling::transport::{
    SessionCredentials, SignalingConnector, SignalingTransport, TransportEvent,
};
use crate::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Request from a [`SessionHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    End(EndReason),
    SendChat(String),
}

/// Everything the session driver reacts to
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Transport(TransportEvent),
    Connection(ConnectionEvent),
    AdaptationTick { generation: u64 },
    NegotiationDeadline { generation: u64 },
    Command(SessionCommand),
}

/// One call attempt between two participants
pub struct CallSession {
    session_id: String,
    config: CallSessionConfig,
    status: ConnectionStatus,
    negotiator: Negotiator,
    transport: Arc<dyn SignalingTransport>,
    media: LocalMedia,
    observer: Arc<dyn SessionObserver>,
    controller: AdaptiveBitrateController,
    ticker: Option<AdaptationTicker>,
    deadline: Option<JoinHandle<()>>,
    terminated: Option<TerminationReason>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_rx: mpsc::UnboundedReceiver<SessionEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    phase_tx: watch::Sender<NegotiationPhase>,
}

impl CallSession {
    /// Acquire local media, open the signaling channel and create the session
    ///
    /// # Arguments
    ///
    /// * `config` - Session configuration (validated here)
    /// * `credentials` - Session id, auth token and peer from matchmaking
    /// * `capture` - Source of local audio/video
    /// * `engine` - Media engine creating peer connections
    /// * `connector` - Signaling channel factory
    /// * `observer` - Application callbacks
    ///
    /// # Errors
    ///
    /// `Error::Capture` when local media cannot be acquired (nothing else has
    /// been created), or the connector's error when the channel cannot be
    /// opened (capture tracks are stopped first).
    pub async fn start(
        config: CallSessionConfig,
        credentials: SessionCredentials,
        capture: &dyn CaptureSource,
        engine: Arc<dyn MediaEngine>,
        connector: &dyn SignalingConnector,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoint = credentials.endpoint(&config.signaling_url)?;

        info!(
            "Starting call session {} (peer: {})",
            credentials.session_id,
            credentials.peer.as_deref().unwrap_or("unknown")
        );

        let media = capture.acquire(&config.capture).await.map_err(|e| {
            warn!("Local capture failed: {}", e);
            e
        })?;
        for track in media.tracks() {
            observer.on_local_track_ready(track);
        }

        observer.on_status_changed(ConnectionStatus::Connecting);
        let channel = match connector.open(&endpoint).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Signaling channel failed to open: {}", e);
                media.stop_all();
                observer.on_status_changed(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        observer.on_status_changed(ConnectionStatus::Connected);

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Connected);
        let (phase_tx, _) = watch::channel(NegotiationPhase::Uninitialized);

        let ctx = NegotiatorContext {
            engine,
            configurator: MediaPipelineConfigurator::new(
                config.simulcast_enabled,
                config.adaptation.nominal,
            ),
            media: media.clone(),
            transport: Arc::clone(&channel.transport),
            connection_events: connection_tx,
        };
        let mut negotiator = Negotiator::new(ctx, config.max_pending_candidates);
        negotiator.start();
        phase_tx.send_replace(negotiator.phase());

        Ok(Self {
            session_id: credentials.session_id,
            controller: AdaptiveBitrateController::new(config.adaptation.clone()),
            config,
            status: ConnectionStatus::Connected,
            negotiator,
            transport: channel.transport,
            media,
            observer,
            ticker: None,
            deadline: None,
            terminated: None,
            transport_events: Some(channel.events),
            connection_events: connection_rx,
            internal_tx,
            internal_rx,
            status_tx,
            phase_tx,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.negotiator.phase()
    }

    pub fn role(&self) -> Role {
        self.negotiator.role()
    }

    pub fn generation(&self) -> Option<u64> {
        self.negotiator.generation()
    }

    pub fn remote_description_applied(&self) -> bool {
        self.negotiator.remote_description_applied()
    }

    pub fn pending_candidates(&self) -> usize {
        self.negotiator.pending_candidates()
    }

    /// Remote candidates discarded because the buffer was full
    pub fn dropped_candidates(&self) -> usize {
        self.negotiator.dropped_candidates()
    }

    /// Whether an adaptation ticker is running
    pub fn is_adapting(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.media
    }

    pub fn termination_reason(&self) -> Option<&TerminationReason> {
        self.terminated.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    /// Handle for ending the session and sending chat from other tasks
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(
            self.internal_tx.clone(),
            self.status_tx.subscribe(),
            self.phase_tx.subscribe(),
        )
    }

    /// Drive the session until it terminates
    pub async fn run(mut self) -> TerminationReason {
        loop {
            if let Some(reason) = &self.terminated {
                return reason.clone();
            }

            let event = tokio::select! {
                event = next_transport_event(&mut self.transport_events) => {
                    SessionEvent::Transport(event)
                }
                Some(event) = self.connection_events.recv() => SessionEvent::Connection(event),
                Some(event) = self.internal_rx.recv() => event,
            };

            self.handle_event(event).await;
        }
    }

    /// Handle every event that is already queued, without waiting
    ///
    /// Returns the number of events handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = if let Some(Ok(event)) =
                self.transport_events.as_mut().map(|rx| rx.try_recv())
            {
                SessionEvent::Transport(event)
            } else if let Ok(event) = self.connection_events.try_recv() {
                SessionEvent::Connection(event)
            } else if let Ok(event) = self.internal_rx.try_recv() {
                event
            } else {
                return handled;
            };

            self.handle_event(event).await;
            handled += 1;
        }
    }

    /// Process one event
    ///
    /// Every event after termination is a no-op.
    pub async fn handle_event(&mut self, event: SessionEvent) {
        if self.terminated.is_some() {
            trace!("Session {} ended; ignoring {:?}", self.session_id, event);
            return;
        }

        match event {
            SessionEvent::Transport(TransportEvent::Envelope(envelope)) => {
                self.handle_envelope(envelope).await
            }
            SessionEvent::Transport(TransportEvent::Error(message)) => {
                self.handle_transport_failure(message).await
            }
            SessionEvent::Transport(TransportEvent::Closed) => {
                self.handle_transport_failure("signaling channel closed".to_string())
                    .await
            }
            SessionEvent::Connection(event) => self.handle_connection_event(event),
            SessionEvent::AdaptationTick { generation } => self.handle_tick(generation).await,
            SessionEvent::NegotiationDeadline { generation } => {
                self.handle_deadline(generation).await
            }
            SessionEvent::Command(SessionCommand::End(reason)) => {
                self.terminate(TerminationReason::Local(reason)).await;
            }
            SessionEvent::Command(SessionCommand::SendChat(content)) => {
                self.transport
                    .send(OutboundEnvelope::ChatMessage { content });
            }
        }

        self.phase_tx.send_replace(self.negotiator.phase());
    }

    async fn handle_envelope(&mut self, envelope: SignalEnvelope) {
        let kind = envelope.kind();
        debug!("Session {} received {}", self.session_id, kind);

        let result = match envelope {
            SignalEnvelope::Role { role } => self.negotiator.handle_role(&role).await,
            SignalEnvelope::IceServerConfig(ice) => self.negotiator.handle_ice_config(ice).await,
            SignalEnvelope::PeerJoined { peer_id } => {
                debug!("Peer joined: {}", peer_id.as_deref().unwrap_or("?"));
                self.negotiator.handle_peer_joined().await
            }
            SignalEnvelope::PeerLeft { peer_id } => {
                info!("Peer left: {}", peer_id.as_deref().unwrap_or("?"));
                self.terminate(TerminationReason::PeerLeft).await;
                return;
            }
            SignalEnvelope::SessionTerminated { reason } => {
                self.terminate(TerminationReason::RemoteTerminated(reason))
                    .await;
                return;
            }
            SignalEnvelope::Offer(offer) => self.negotiator.handle_offer(offer).await,
            SignalEnvelope::Answer(answer) => self.negotiator.handle_answer(answer).await,
            SignalEnvelope::Candidate(candidate) => {
                self.negotiator.handle_remote_candidate(candidate).await
            }
            SignalEnvelope::Chat(message) => {
                self.observer.on_chat_message(&message);
                return;
            }
        };

        // Steps completed before a failure still count
        let progress = self.negotiator.take_progress();
        self.apply_progress(progress);

        match result {
            Ok(()) => {}
            Err(e) if e.is_signaling_error() => warn!("Dropping {} envelope: {}", kind, e),
            Err(e) if e.is_negotiation_error() => {
                warn!("Negotiation step for {} failed, not retrying: {}", kind, e)
            }
            Err(e) => error!("Handling {} failed: {}", kind, e),
        }
    }

    fn apply_progress(&mut self, progress: Vec<Progress>) {
        for step in progress {
            match step {
                Progress::RoleAssigned(role) => self.observer.on_role_assigned(role),
                Progress::GenerationClosed(generation) => {
                    debug!("Generation {} closed", generation);
                    self.stop_generation_tasks();
                }
                Progress::GenerationStarted(generation) => self.start_generation_tasks(generation),
                Progress::OfferSent(generation) => self.arm_deadline(generation),
                Progress::AnswerSent(generation) => {
                    debug!("Answer sent for generation {}", generation)
                }
                Progress::Active(generation) => {
                    info!("Session {} generation {} active", self.session_id, generation);
                    if let Some(deadline) = self.deadline.take() {
                        deadline.abort();
                    }
                }
            }
        }
    }

    fn stop_generation_tasks(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel();
        }
    }

    /// Restart the adaptation clock for a new generation
    fn start_generation_tasks(&mut self, generation: u64) {
        self.stop_generation_tasks();
        self.controller.reset();

        if !self.config.adaptation.enabled {
            return;
        }

        let tx = self.internal_tx.clone();
        self.ticker = Some(AdaptationTicker::spawn(
            generation,
            self.config.adaptation.interval(),
            move |generation| tx.send(SessionEvent::AdaptationTick { generation }).is_ok(),
        ));
    }

    fn arm_deadline(&mut self, generation: u64) {
        let Some(timeout) = self.config.negotiation_timeout() else {
            return;
        };
        if let Some(previous) = self.deadline.take() {
            previous.abort();
        }

        let tx = self.internal_tx.clone();
        self.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(SessionEvent::NegotiationDeadline { generation });
        }));
    }

    async fn handle_deadline(&mut self, generation: u64) {
        if self.negotiator.generation() != Some(generation) {
            return;
        }
        if self.negotiator.phase() == NegotiationPhase::Active {
            return;
        }
        warn!(
            "Generation {} did not complete negotiation in time",
            generation
        );
        self.terminate(TerminationReason::NegotiationTimeout).await;
    }

    async fn handle_tick(&mut self, generation: u64) {
        if self.negotiator.generation() != Some(generation) {
            trace!("Ignoring tick for stale generation {}", generation);
            return;
        }
        let (Some(connection), Some(writer)) =
            (self.negotiator.connection(), self.negotiator.writer())
        else {
            return;
        };

        self.controller.tick(connection.as_ref(), &writer).await;
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let current = self.negotiator.generation() == Some(event.generation);

        match event.kind {
            ConnectionEventKind::LocalCandidate(candidate) => {
                self.negotiator
                    .handle_local_candidate(event.generation, candidate);
            }
            ConnectionEventKind::RemoteTrack(track) if current => {
                info!("Remote {} track ready: {}", track.kind, track.id);
                self.observer.on_remote_track_ready(&track);
            }
            ConnectionEventKind::RemoteTrack(track) => {
                debug!(
                    "Ignoring remote track {} from stale generation {}",
                    track.id, event.generation
                );
            }
            ConnectionEventKind::StateChanged(state) => {
                debug!(
                    "Generation {} peer connection {:?}",
                    event.generation, state
                );
                if current && state == PeerState::Failed {
                    warn!(
                        "Peer connection for generation {} failed",
                        event.generation
                    );
                }
            }
        }
    }

    async fn handle_transport_failure(&mut self, message: String) {
        warn!("Session {} signaling failure: {}", self.session_id, message);
        self.set_status(ConnectionStatus::Disconnected);

        if self.negotiator.phase() == NegotiationPhase::Active {
            info!("Media already flowing; keeping the peer connection");
            return;
        }

        self.terminate(TerminationReason::TransportLost(message))
            .await;
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        if self.status == ConnectionStatus::Disconnected {
            debug!("Ignoring status {:?} after disconnect", status);
            return;
        }
        debug!("Session {} status {:?} -> {:?}", self.session_id, self.status, status);
        self.status = status;
        self.status_tx.send_replace(status);
        self.observer.on_status_changed(status);
    }

    /// Tear the session down
    ///
    /// Returns `true` for the call that performed the teardown; every later
    /// call is a no-op returning `false`.
    pub async fn terminate(&mut self, reason: TerminationReason) -> bool {
        if self.terminated.is_some() {
            return false;
        }
        info!("Terminating session {}: {}", self.session_id, reason);
        self.terminated = Some(reason.clone());

        if let TerminationReason::Local(end) = &reason {
            self.transport.send(OutboundEnvelope::EndSession {
                reason: end.as_str().to_string(),
            });
        }

        self.stop_generation_tasks();
        self.negotiator.shutdown().await;
        self.transport.close();
        let stopped = self.media.stop_all();
        debug!("Stopped {} local tracks", stopped);

        self.set_status(ConnectionStatus::Disconnected);
        self.phase_tx.send_replace(NegotiationPhase::Ended);
        self.observer.on_terminated(&reason);
        true
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if self.terminated.is_none() {
            // Best effort when dropped mid-call; the connection closes with its owner
            self.media.stop_all();
            self.transport.close();
        }
    }
}

/// Next event from the transport; pending forever once the stream is gone
async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };

    match rx.recv().await {
        Some(event) => event,
        None => {
            *events = None;
            TransportEvent::Closed
        }
    }
}
