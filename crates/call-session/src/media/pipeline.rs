//! Per-generation media setup
//!
//! [`MediaPipelineConfigurator`] turns a fresh peer connection into a
//! sending pipeline: every local track attached, video as three simulcast
//! encodings when the engine allows it, and the nominal bitrate caps
//! applied. Later cap changes go through the generation's single
//! [`LayerParameterWriter`].

use crate::engine::{ConnectionEvent, MediaEngine, PeerConnectionHandle};
use crate::media::capture::{LocalMedia, LocalTrack, MediaKind};
use crate::media::layers::{BitratePreset, SimulcastLayers};
use crate::signaling::envelope::IceServerConfig;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Serialized writer of the video sender's encoding parameters
///
/// The async mutex is held across the engine call, so at most one update
/// is in flight and the recorded layers always match what the engine last
/// accepted.
pub struct LayerParameterWriter {
    connection: Arc<dyn PeerConnectionHandle>,
    layers: Mutex<SimulcastLayers>,
    video: Option<LocalTrack>,
    simulcast: bool,
}

impl LayerParameterWriter {
    pub fn new(
        connection: Arc<dyn PeerConnectionHandle>,
        layers: SimulcastLayers,
        video: Option<LocalTrack>,
        simulcast: bool,
    ) -> Self {
        Self {
            connection,
            layers: Mutex::new(layers),
            video,
            simulcast,
        }
    }

    /// Rewrite all three caps in one engine call
    ///
    /// Returns `Ok(false)` without touching the engine when the caps already
    /// match `preset`.
    pub async fn apply(&self, preset: BitratePreset) -> Result<bool> {
        self.write(preset, false).await
    }

    /// Push the current caps to the engine even if unchanged
    pub async fn apply_current(&self) -> Result<()> {
        let preset = self.current().await;
        self.write(preset, true).await.map(|_| ())
    }

    async fn write(&self, preset: BitratePreset, force: bool) -> Result<bool> {
        let mut layers = self.layers.lock().await;

        let mut next = *layers;
        if !next.apply_preset(preset) && !force {
            return Ok(false);
        }

        self.connection.apply_encoding_parameters(&next).await?;
        *layers = next;

        if let Some(video) = &self.video {
            video.publish_targets(preset);
        }

        debug!(
            "Generation {} layer caps now {:?}",
            self.connection.generation(),
            preset
        );
        Ok(true)
    }

    /// Caps last accepted by the engine
    pub async fn current(&self) -> BitratePreset {
        self.layers.lock().await.bitrates()
    }

    /// Whether the video sender carries three encodings
    pub fn is_simulcast(&self) -> bool {
        self.simulcast
    }
}

/// A peer connection with its media attached
pub struct ConfiguredGeneration {
    pub connection: Arc<dyn PeerConnectionHandle>,
    pub writer: Arc<LayerParameterWriter>,
}

/// Builds the media side of each connection generation
#[derive(Debug, Clone)]
pub struct MediaPipelineConfigurator {
    simulcast_enabled: bool,
    nominal: BitratePreset,
}

impl MediaPipelineConfigurator {
    pub fn new(simulcast_enabled: bool, nominal: BitratePreset) -> Self {
        Self {
            simulcast_enabled,
            nominal,
        }
    }

    /// Create and configure the connection for one generation
    ///
    /// # Arguments
    ///
    /// * `engine` - Media engine creating the connection
    /// * `generation` - Generation id
    /// * `ice` - ICE servers for this generation
    /// * `media` - Local capture tracks to send
    /// * `events` - Sink for the connection's asynchronous events
    pub async fn build(
        &self,
        engine: &dyn MediaEngine,
        generation: u64,
        ice: &IceServerConfig,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<ConfiguredGeneration> {
        let connection = engine.create_connection(generation, ice, events).await?;

        let simulcast = match self.attach_tracks(connection.as_ref(), media).await {
            Ok(simulcast) => simulcast,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!("Failed to close half-built connection: {}", close_err);
                }
                return Err(e);
            }
        };

        let writer = Arc::new(LayerParameterWriter::new(
            Arc::clone(&connection),
            SimulcastLayers::with_preset(self.nominal),
            media.video().cloned(),
            simulcast,
        ));

        if media.video().is_some() {
            if let Err(e) = writer.apply_current().await {
                warn!(
                    "Generation {}: initial encoding parameters not applied: {}",
                    generation, e
                );
            }
        }

        info!(
            "Generation {} media configured ({} tracks, simulcast={})",
            generation,
            media.tracks().len(),
            simulcast
        );

        Ok(ConfiguredGeneration { connection, writer })
    }

    /// Attach every track; returns whether video went out as simulcast
    async fn attach_tracks(
        &self,
        connection: &dyn PeerConnectionHandle,
        media: &LocalMedia,
    ) -> Result<bool> {
        let mut simulcast = false;

        for track in media.tracks() {
            if track.kind() == MediaKind::Video && self.simulcast_enabled {
                let layers = SimulcastLayers::with_preset(self.nominal);
                match connection.attach_simulcast_track(track, &layers).await {
                    Ok(()) => {
                        simulcast = true;
                        continue;
                    }
                    Err(Error::SimulcastRejected(reason)) => {
                        warn!(
                            "Simulcast rejected ({}), sending a single video layer",
                            reason
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            connection.attach_track(track).await?;
        }

        Ok(simulcast)
    }
}
