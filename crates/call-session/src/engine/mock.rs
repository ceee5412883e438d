//! Scriptable in-process media engine for tests
//!
//! Every call on a [`MockConnection`] is recorded as a [`MockOp`] so tests
//! can assert ordering (e.g. no candidate before the remote description).
//! Statistics are served from a per-connection script.

use crate::adaptation::NetworkSample;
use crate::engine::{
    ConnectionEvent, ConnectionEventKind, MediaEngine, PeerConnectionHandle, PeerState,
    RemoteTrack,
};
use crate::media::capture::{LocalTrack, MediaKind};
use crate::media::layers::{BitratePreset, SimulcastLayers};
use crate::signaling::envelope::{
    CandidateDescriptor, IceServerConfig, SdpKind, SessionDescription,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One recorded engine call
#[derive(Debug, Clone, PartialEq)]
pub enum MockOp {
    AttachTrack { track_id: String, kind: MediaKind },
    AttachSimulcast { track_id: String },
    ApplyEncoding(BitratePreset),
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SdpKind),
    AddCandidate(String),
    Close,
}

/// Scripted result of one stats sample
#[derive(Debug, Clone)]
pub enum StatsScript {
    Sample(NetworkSample),
    /// No outbound video yet
    Empty,
    /// The engine failed to produce statistics
    Unavailable,
}

#[derive(Default)]
struct EngineState {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    ice_configs: Mutex<Vec<IceServerConfig>>,
    reject_simulcast: AtomicBool,
    fail_create: AtomicBool,
    fail_remote_descriptions: AtomicBool,
}

/// Media engine handing out [`MockConnection`]s
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<EngineState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every new connection refuse multi-layer video
    pub fn reject_simulcast(&self, reject: bool) {
        self.state.reject_simulcast.store(reject, Ordering::Release);
    }

    /// Make `create_connection` fail
    pub fn fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::Release);
    }

    /// Make every new connection reject remote descriptions
    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.state
            .fail_remote_descriptions
            .store(fail, Ordering::Release);
    }

    /// Connections created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.state.connections.lock().clone()
    }

    pub fn connection(&self, generation: u64) -> Option<Arc<MockConnection>> {
        self.state
            .connections
            .lock()
            .iter()
            .find(|c| c.generation == generation)
            .cloned()
    }

    pub fn latest(&self) -> Option<Arc<MockConnection>> {
        self.state.connections.lock().last().cloned()
    }

    /// ICE configurations passed to `create_connection`
    pub fn ice_configs(&self) -> Vec<IceServerConfig> {
        self.state.ice_configs.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_connection(
        &self,
        generation: u64,
        ice: &IceServerConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>> {
        if self.state.fail_create.load(Ordering::Acquire) {
            return Err(Error::PeerConnectionError(
                "mock engine refused to create a connection".to_string(),
            ));
        }

        self.state.ice_configs.lock().push(ice.clone());

        let connection = Arc::new(MockConnection {
            generation,
            events,
            reject_simulcast: self.state.reject_simulcast.load(Ordering::Acquire),
            ops: Mutex::new(Vec::new()),
            stats: Mutex::new(VecDeque::new()),
            failing_candidates: Mutex::new(HashSet::new()),
            fail_remote_description: AtomicBool::new(
                self.state.fail_remote_descriptions.load(Ordering::Acquire),
            ),
            fail_encoding: AtomicBool::new(false),
        });

        self.state.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Recorded, scriptable peer connection
pub struct MockConnection {
    generation: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    reject_simulcast: bool,
    ops: Mutex<Vec<MockOp>>,
    stats: Mutex<VecDeque<StatsScript>>,
    failing_candidates: Mutex<HashSet<String>>,
    fail_remote_description: AtomicBool,
    fail_encoding: AtomicBool,
}

impl MockConnection {
    pub fn ops(&self) -> Vec<MockOp> {
        self.ops.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.count(|op| matches!(op, MockOp::CreateOffer))
    }

    pub fn answers_created(&self) -> usize {
        self.count(|op| matches!(op, MockOp::CreateAnswer))
    }

    pub fn close_count(&self) -> usize {
        self.count(|op| matches!(op, MockOp::Close))
    }

    /// Candidate lines handed to the engine, in order
    pub fn candidates_added(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                MockOp::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every bitrate set applied to the video sender, in order
    pub fn applied_bitrates(&self) -> Vec<BitratePreset> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                MockOp::ApplyEncoding(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SdpKind> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                MockOp::SetRemoteDescription(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    /// Queue the result of the next stats sample
    pub fn push_stats(&self, script: StatsScript) {
        self.stats.lock().push_back(script);
    }

    /// Make `add_ice_candidate` fail for this candidate line
    pub fn fail_candidate(&self, candidate: impl Into<String>) {
        self.failing_candidates.lock().insert(candidate.into());
    }

    pub fn fail_remote_description(&self, fail: bool) {
        self.fail_remote_description.store(fail, Ordering::Release);
    }

    pub fn fail_encoding(&self, fail: bool) {
        self.fail_encoding.store(fail, Ordering::Release);
    }

    /// Emit a local candidate as the engine would during gathering
    pub fn emit_local_candidate(&self, candidate: CandidateDescriptor) {
        self.emit(ConnectionEventKind::LocalCandidate(candidate));
    }

    pub fn emit_state(&self, state: PeerState) {
        self.emit(ConnectionEventKind::StateChanged(state));
    }

    pub fn emit_remote_track(&self, kind: MediaKind) {
        self.emit(ConnectionEventKind::RemoteTrack(RemoteTrack {
            id: format!("remote-{}-{}", kind, self.generation),
            stream_id: "remote-stream".to_string(),
            kind,
            source: None,
        }));
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent {
            generation: self.generation,
            kind,
        });
    }

    fn record(&self, op: MockOp) {
        self.ops.lock().push(op);
    }

    fn count(&self, predicate: impl Fn(&MockOp) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| predicate(op)).count()
    }
}

#[async_trait]
impl PeerConnectionHandle for MockConnection {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<()> {
        self.record(MockOp::AttachTrack {
            track_id: track.id().to_string(),
            kind: track.kind(),
        });
        Ok(())
    }

    async fn attach_simulcast_track(
        &self,
        track: &LocalTrack,
        _layers: &SimulcastLayers,
    ) -> Result<()> {
        if self.reject_simulcast {
            return Err(Error::SimulcastRejected(
                "mock engine has simulcast disabled".to_string(),
            ));
        }
        self.record(MockOp::AttachSimulcast {
            track_id: track.id().to_string(),
        });
        Ok(())
    }

    async fn apply_encoding_parameters(&self, layers: &SimulcastLayers) -> Result<()> {
        if self.fail_encoding.load(Ordering::Acquire) {
            return Err(Error::MediaTrackError("mock encoding failure".to_string()));
        }
        self.record(MockOp::ApplyEncoding(layers.bitrates()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(MockOp::CreateOffer);
        Ok(SessionDescription::offer(format!(
            "v=0 mock-offer-{}",
            self.generation
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(MockOp::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "v=0 mock-answer-{}",
            self.generation
        )))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        if self.fail_remote_description.load(Ordering::Acquire) {
            return Err(Error::SdpError("mock remote description failure".to_string()));
        }
        self.record(MockOp::SetRemoteDescription(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &CandidateDescriptor) -> Result<()> {
        if self.failing_candidates.lock().contains(&candidate.candidate) {
            return Err(Error::IceCandidateError(format!(
                "mock rejected {}",
                candidate.candidate
            )));
        }
        self.record(MockOp::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn outbound_video_stats(&self) -> Result<Option<NetworkSample>> {
        match self.stats.lock().pop_front() {
            Some(StatsScript::Sample(sample)) => Ok(Some(sample)),
            Some(StatsScript::Empty) | None => Ok(None),
            Some(StatsScript::Unavailable) => Err(Error::StatsUnavailable(
                "mock stats unavailable".to_string(),
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        self.record(MockOp::Close);
        Ok(())
    }
}
