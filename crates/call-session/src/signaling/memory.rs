//! In-memory signaling relay for tests
//!
//! [`MemorySignaling`] is a [`SignalingConnector`] whose channels are
//! driven by a [`MemoryRelay`] handle: tests push inbound frames through the
//! relay and read back everything the session sent.

use crate::signaling::envelope::{OutboundEnvelope, SignalEnvelope};
use crate::signaling::transport::{
    SignalingChannel, SignalingConnector, SignalingTransport, TransportEvent,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

#[derive(Default)]
struct RelayState {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: Mutex<Vec<OutboundEnvelope>>,
    endpoints: Mutex<Vec<Url>>,
    open: AtomicBool,
    close_calls: AtomicUsize,
    refuse: AtomicBool,
}

/// Test-side handle onto the in-memory relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

impl MemoryRelay {
    /// Deliver a raw text frame, decoded the same way as the WebSocket client
    ///
    /// Returns `false` if the frame was dropped (malformed, unknown tag, or
    /// no open channel).
    pub fn deliver_raw(&self, text: &str) -> bool {
        match SignalEnvelope::parse(text) {
            Ok(Some(envelope)) => self.deliver(envelope),
            Ok(None) => false,
            Err(e) => {
                debug!("Memory relay dropping frame: {}", e);
                false
            }
        }
    }

    /// Deliver a decoded envelope
    pub fn deliver(&self, envelope: SignalEnvelope) -> bool {
        self.push(TransportEvent::Envelope(envelope))
    }

    /// Inject a transport error
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.push(TransportEvent::Error(message.into()))
    }

    /// Simulate the relay closing the channel
    pub fn disconnect(&self) {
        self.push(TransportEvent::Closed);
        self.state.open.store(false, Ordering::Release);
        self.state.events.lock().take();
    }

    /// Make subsequent `open` calls fail
    pub fn refuse_connections(&self) {
        self.state.refuse.store(true, Ordering::Release);
    }

    /// Everything the client sent, in order
    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.state.sent.lock().clone()
    }

    /// Drain what the client sent so far
    pub fn take_sent(&self) -> Vec<OutboundEnvelope> {
        std::mem::take(&mut *self.state.sent.lock())
    }

    /// Endpoints the client connected to
    pub fn endpoints(&self) -> Vec<Url> {
        self.state.endpoints.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    /// Number of times the client closed its channel (idempotent calls included)
    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::Acquire)
    }

    fn push(&self, event: TransportEvent) -> bool {
        match self.state.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// Connector producing in-memory channels bound to one [`MemoryRelay`]
#[derive(Clone, Default)]
pub struct MemorySignaling {
    relay: MemoryRelay,
}

impl MemorySignaling {
    /// Create a connector and the relay handle that drives it
    pub fn new() -> (Self, MemoryRelay) {
        let relay = MemoryRelay::default();
        (
            Self {
                relay: relay.clone(),
            },
            relay,
        )
    }
}

struct MemoryTransport {
    state: Arc<RelayState>,
}

impl SignalingTransport for MemoryTransport {
    fn send(&self, envelope: OutboundEnvelope) {
        if !self.is_open() {
            debug!("Memory channel closed, dropping {} envelope", envelope.kind());
            return;
        }
        self.state.sent.lock().push(envelope);
    }

    fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::AcqRel);
        if self.state.open.swap(false, Ordering::AcqRel) {
            self.state.events.lock().take();
        }
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SignalingConnector for MemorySignaling {
    async fn open(&self, endpoint: &Url) -> Result<SignalingChannel> {
        let state = &self.relay.state;
        if state.refuse.load(Ordering::Acquire) {
            return Err(Error::SignalingError(format!(
                "connection to {} refused",
                endpoint.path()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *state.events.lock() = Some(tx);
        state.endpoints.lock().push(endpoint.clone());
        state.open.store(true, Ordering::Release);

        Ok(SignalingChannel {
            transport: Arc::new(MemoryTransport {
                state: Arc::clone(state),
            }),
            events: rx,
        })
    }
}
