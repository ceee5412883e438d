//! Call session test harness
//!
//! Builds a [`CallSession`] on top of the mock engine and the in-memory
//! relay so integration tests can script relay traffic frame by frame and
//! inspect everything the session did.
//!
//! Basic usage pattern:
//!
//! 1. `TestSession::start(config)` (or `TestSession::default_started()`)
//! 2. Push relay frames with `deliver(json!(...))`; each call handles every
//!    queued event before returning
//! 3. Inspect `engine`, `relay` and `observer`

#![allow(dead_code)]

use parking_lot::Mutex;
use remotemedia_call_session::engine::mock::{MockConnection, MockEngine};
use remotemedia_call_session::signaling::memory::{MemoryRelay, MemorySignaling};
use remotemedia_call_session::{
    CallSession, CallSessionConfig, ChatMessage, ConnectionStatus, LocalTrack, RemoteTrack, Role,
    SessionCredentials, SessionObserver, SyntheticCapture, TerminationReason,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const RELAY_URL: &str = "ws://relay.test";

/// Install a test subscriber once; honours RUST_LOG
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One observer notification
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Status(ConnectionStatus),
    Role(Role),
    LocalTrack(String),
    RemoteTrack(String),
    Chat(String),
    Terminated(TerminationReason),
}

/// Observer that records every notification in order
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn terminations(&self) -> Vec<TerminationReason> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Terminated(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn remote_tracks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::RemoteTrack(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Observed) {
        self.events.lock().push(event);
    }
}

impl SessionObserver for RecordingObserver {
    fn on_status_changed(&self, status: ConnectionStatus) {
        self.push(Observed::Status(status));
    }

    fn on_role_assigned(&self, role: Role) {
        self.push(Observed::Role(role));
    }

    fn on_local_track_ready(&self, track: &LocalTrack) {
        self.push(Observed::LocalTrack(track.label().to_string()));
    }

    fn on_remote_track_ready(&self, track: &RemoteTrack) {
        self.push(Observed::RemoteTrack(track.id.clone()));
    }

    fn on_chat_message(&self, message: &ChatMessage) {
        self.push(Observed::Chat(message.content.clone()));
    }

    fn on_terminated(&self, reason: &TerminationReason) {
        self.push(Observed::Terminated(reason.clone()));
    }
}

/// A started session wired to the mock engine and in-memory relay
pub struct TestSession {
    pub session: CallSession,
    pub engine: MockEngine,
    pub relay: MemoryRelay,
    pub observer: Arc<RecordingObserver>,
}

impl TestSession {
    pub async fn start(config: CallSessionConfig) -> Self {
        init_logging();

        let engine = MockEngine::new();
        let (connector, relay) = MemorySignaling::new();
        let observer = Arc::new(RecordingObserver::default());

        let session = CallSession::start(
            config,
            SessionCredentials::new("session-1", "token-1").with_peer("peer-b"),
            &SyntheticCapture::silent(),
            Arc::new(engine.clone()),
            &connector,
            observer.clone(),
        )
        .await
        .expect("session should start");

        Self {
            session,
            engine,
            relay,
            observer,
        }
    }

    pub async fn default_started() -> Self {
        Self::start(CallSessionConfig::new(RELAY_URL)).await
    }

    /// Push one raw relay frame and handle everything it caused
    pub async fn deliver(&mut self, frame: Value) -> bool {
        let delivered = self.relay.deliver_raw(&frame.to_string());
        self.session.process_pending().await;
        delivered
    }

    /// Handle everything already queued
    pub async fn settle(&mut self) -> usize {
        self.session.process_pending().await
    }

    pub fn connection(&self, generation: u64) -> Arc<MockConnection> {
        self.engine
            .connection(generation)
            .unwrap_or_else(|| panic!("no connection for generation {}", generation))
    }

    /// Drive the session to an initiator with a connection and a sent offer
    pub async fn negotiate_as_initiator(&mut self) {
        self.deliver(role("initiator")).await;
        self.deliver(ice_config()).await;
        self.deliver(peer_joined()).await;
    }
}

pub fn role(value: &str) -> Value {
    serde_json::json!({ "type": "role", "role": value })
}

pub fn ice_config() -> Value {
    serde_json::json!({
        "type": "stun_turn",
        "stun": "stun:stun.test:3478",
        "turn": "turn:turn.test:3478",
        "turn_username": "user",
        "turn_password": "secret"
    })
}

pub fn peer_joined() -> Value {
    serde_json::json!({ "type": "user_connected", "user_id": "peer-b" })
}

pub fn peer_left() -> Value {
    serde_json::json!({ "type": "user_disconnected", "user_id": "peer-b" })
}

pub fn offer(sdp: &str) -> Value {
    serde_json::json!({
        "type": "webrtc_signal",
        "signal_type": "offer",
        "sender_id": "peer-b",
        "data": { "type": "offer", "sdp": sdp }
    })
}

pub fn answer(sdp: &str) -> Value {
    serde_json::json!({
        "type": "webrtc_signal",
        "signal_type": "answer",
        "sender_id": "peer-b",
        "data": { "type": "answer", "sdp": sdp }
    })
}

pub fn candidate(line: &str) -> Value {
    serde_json::json!({
        "type": "webrtc_signal",
        "signal_type": "candidate",
        "sender_id": "peer-b",
        "data": { "candidate": line, "sdpMid": "0", "sdpMLineIndex": 0 }
    })
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
