//! Signaling transport abstraction
//!
//! A transport is a bidirectional message channel to the relay. Opening it
//! yields a sender half (shared, cheap to clone) and a stream of
//! [`TransportEvent`]s consumed by exactly one session driver.

use crate::signaling::envelope::{OutboundEnvelope, SignalEnvelope};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Event delivered by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded inbound envelope
    Envelope(SignalEnvelope),

    /// The channel reported an error; it may or may not still be usable
    Error(String),

    /// The channel is closed; no further events follow
    Closed,
}

/// Sending half of an open signaling channel
pub trait SignalingTransport: Send + Sync {
    /// Queue an envelope for delivery
    ///
    /// Envelopes sent while the channel is not open are logged and dropped.
    fn send(&self, envelope: OutboundEnvelope);

    /// Close the channel; idempotent
    fn close(&self);

    /// Whether the channel currently accepts envelopes
    fn is_open(&self) -> bool;
}

/// An opened channel: sender half plus its event stream
pub struct SignalingChannel {
    pub transport: Arc<dyn SignalingTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory for signaling channels
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a channel to the given endpoint
    async fn open(&self, endpoint: &Url) -> Result<SignalingChannel>;
}

/// Identity of one call attempt, produced by the matchmaking flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    /// Session identifier allocated by the relay
    pub session_id: String,

    /// Bearer token authorising this participant
    pub auth_token: String,

    /// Public identity of the other participant, if known
    pub peer: Option<String>,
}

impl SessionCredentials {
    pub fn new(session_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            auth_token: auth_token.into(),
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// Build `{base}/ws/{session_id}?token={auth_token}`
    ///
    /// # Arguments
    ///
    /// * `base` - Relay base URL (ws:// or wss://), with or without a path
    pub fn endpoint(&self, base: &str) -> Result<Url> {
        if self.session_id.is_empty() {
            return Err(Error::InvalidConfig("session_id must not be empty".to_string()));
        }

        let mut url = Url::parse(base)
            .map_err(|e| Error::InvalidConfig(format!("invalid signaling url '{}': {}", base, e)))?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "signaling url must use ws:// or wss://, got {}",
                base
            )));
        }

        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("signaling url cannot be a base: {}", base)))?
            .pop_if_empty()
            .push("ws")
            .push(&self.session_id);

        url.query_pairs_mut()
            .clear()
            .append_pair("token", &self.auth_token);

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_bare_host() {
        let creds = SessionCredentials::new("abc-123", "tok");
        let url = creds.endpoint("wss://relay.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws/abc-123?token=tok");
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let creds = SessionCredentials::new("s1", "a b");
        let url = creds.endpoint("ws://localhost:8000/api/").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/api/ws/s1?token=a+b");
    }

    #[test]
    fn test_endpoint_rejects_http() {
        let creds = SessionCredentials::new("s1", "t");
        assert!(matches!(
            creds.endpoint("http://relay"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_endpoint_rejects_empty_session() {
        let creds = SessionCredentials::new("", "t");
        assert!(creds.endpoint("ws://relay").is_err());
    }
}
