//! WebSocket signaling client
//!
//! One reader task decodes frames into [`TransportEvent`]s and one writer
//! task drains an mpsc queue of outbound frames, so `send` never blocks the
//! session driver.

use crate::signaling::envelope::{OutboundEnvelope, SignalEnvelope};
use crate::signaling::transport::{
    SignalingChannel, SignalingConnector, SignalingTransport, TransportEvent,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Default time allowed for the WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum WriterCommand {
    Text(String),
    Close,
}

/// Sending half of a WebSocket signaling channel
pub struct WebSocketSignaling {
    outgoing: mpsc::UnboundedSender<WriterCommand>,
    open: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport for WebSocketSignaling {
    fn send(&self, envelope: OutboundEnvelope) {
        if !self.is_open() {
            debug!(
                "Signaling channel not open, dropping {} envelope",
                envelope.kind()
            );
            return;
        }

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {} envelope: {}", envelope.kind(), e);
                return;
            }
        };

        trace!("Queueing {} envelope ({} bytes)", envelope.kind(), text.len());

        if self.outgoing.send(WriterCommand::Text(text)).is_err() {
            debug!("Signaling writer gone, dropping {} envelope", envelope.kind());
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        info!("Closing signaling channel");
        let _ = self.outgoing.send(WriterCommand::Close);

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Opens [`WebSocketSignaling`] channels with `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn open(&self, endpoint: &Url) -> Result<SignalingChannel> {
        // The query string carries the auth token
        let relay_addr = format!(
            "{}://{}{}",
            endpoint.scheme(),
            endpoint.host_str().unwrap_or_default(),
            endpoint.path()
        );
        info!("Connecting to signaling relay at {}", relay_addr);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| {
                Error::WebSocketError(format!(
                    "connect to {} timed out after {:?}",
                    relay_addr, self.connect_timeout
                ))
            })?
            .map_err(|e| Error::WebSocketError(format!("connect to {} failed: {}", relay_addr, e)))?;

        debug!("Signaling WebSocket connected: {}", relay_addr);

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(command) = outgoing_rx.recv().await {
                match command {
                    WriterCommand::Text(text) => {
                        if let Err(e) = ws_write.send(Message::Text(text)).await {
                            warn!("Signaling write failed: {}", e);
                            writer_open.store(false, Ordering::Release);
                            break;
                        }
                    }
                    WriterCommand::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
            trace!("Signaling writer task exiting");
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary signaling frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("Signaling relay closed the channel: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling channel error: {}", e);
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                };

                match SignalEnvelope::parse(&text) {
                    Ok(Some(envelope)) => {
                        trace!("Received {} envelope", envelope.kind());
                        if events_tx.send(TransportEvent::Envelope(envelope)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping signaling frame: {}", e),
                }
            }

            reader_open.store(false, Ordering::Release);
            let _ = events_tx.send(TransportEvent::Closed);
            trace!("Signaling reader task exiting");
        });

        let transport = Arc::new(WebSocketSignaling {
            outgoing: outgoing_tx,
            open,
            reader: Mutex::new(Some(reader)),
        });

        Ok(SignalingChannel {
            transport,
            events: events_rx,
        })
    }
}
