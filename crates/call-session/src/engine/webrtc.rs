//! webrtc-rs backed media engine
//!
//! Each generation gets its own `RTCPeerConnection` built from a fresh
//! `MediaEngine` (default codecs) and the default interceptor chain. Local
//! tracks are fed from [`LocalTrack`] sample broadcasts by one forwarding
//! task per sender.
//!
//! webrtc-rs exposes no per-encoding max bitrate, so the caps from
//! `apply_encoding_parameters` are enforced by the forwarders: each video
//! rid track has a [`LayerPacer`] that drops samples over its cap.

use crate::adaptation::NetworkSample;
use crate::engine::{
    ConnectionEvent, ConnectionEventKind, MediaEngine, PeerConnectionHandle, PeerState,
    RemoteTrack,
};
use crate::media::capture::{LocalTrack, MediaKind, MediaSample};
use crate::media::layers::{BitratePreset, LayerId, SimulcastLayers};
use crate::media::pacing::LayerPacer;
use crate::signaling::envelope::{
    CandidateDescriptor, IceServerConfig, SdpKind, SessionDescription,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

/// Media engine creating webrtc-rs peer connections
#[derive(Debug, Clone, Default)]
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }

    /// Create the peer connection for one generation
    ///
    /// # Arguments
    ///
    /// * `generation` - Generation id stamped on every event
    /// * `ice` - STUN/TURN servers for this generation
    /// * `events` - Sink for candidates, state changes and remote tracks
    #[instrument(skip(self, ice, events))]
    pub async fn connect(
        &self,
        generation: u64,
        ice: &IceServerConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<WebRtcPeerConnection>> {
        info!("Creating peer connection for generation {}", generation);

        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut codecs)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = ice
            .entries()
            .into_iter()
            .map(|entry| RTCIceServer {
                urls: entry.urls,
                username: entry.username,
                credential: entry.credential,
                ..Default::default()
            })
            .collect();

        debug!("Generation {} using {} ICE server(s)", generation, ice_servers.len());

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!("Generation {} finished gathering", generation);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let descriptor = CandidateDescriptor {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = tx.send(ConnectionEvent {
                            generation,
                            kind: ConnectionEventKind::LocalCandidate(descriptor),
                        });
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                if let Some(state) = map_state(s) {
                    debug!("Generation {} peer state: {:?}", generation, state);
                    let _ = tx.send(ConnectionEvent {
                        generation,
                        kind: ConnectionEventKind::StateChanged(state),
                    });
                }
            })
        }));

        let track_tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                info!(
                    "Remote {} track arrived on generation {}: id={}",
                    kind,
                    generation,
                    track.id()
                );
                let remote = RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    source: Some(track as Arc<dyn Any + Send + Sync>),
                };
                let _ = tx.send(ConnectionEvent {
                    generation,
                    kind: ConnectionEventKind::RemoteTrack(remote),
                });
            })
        }));

        Ok(Arc::new(WebRtcPeerConnection {
            generation,
            pc,
            stream_id: format!("call-{}", uuid::Uuid::new_v4()),
            tasks: Mutex::new(Vec::new()),
            video_frames: Arc::new(AtomicU64::new(0)),
            fps_window: Mutex::new((Instant::now(), 0)),
            caps: watch::channel(BitratePreset::NOMINAL).0,
        }))
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        generation: u64,
        ice: &IceServerConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>> {
        let connection = self.connect(generation, ice, events).await?;
        Ok(connection as Arc<dyn PeerConnectionHandle>)
    }
}

/// One generation's `RTCPeerConnection`
pub struct WebRtcPeerConnection {
    generation: u64,
    pc: Arc<RTCPeerConnection>,
    stream_id: String,
    /// Sample forwarders and RTCP readers
    tasks: Mutex<Vec<JoinHandle<()>>>,
    video_frames: Arc<AtomicU64>,
    /// Instant and frame count at the previous stats sample
    fps_window: Mutex<(Instant, u64)>,
    /// Video caps the forwarders pace against
    caps: watch::Sender<BitratePreset>,
}

impl WebRtcPeerConnection {
    async fn add_sender(&self, track: Arc<TrackLocalStaticSample>) -> Result<Arc<RTCRtpSender>> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        // Interceptors only run while RTCP is read
        let rtcp_sender = Arc::clone(&sender);
        let rtcp_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });
        self.tasks.lock().push(rtcp_task);

        Ok(sender)
    }

    /// Spawn the task copying samples from a local track into webrtc tracks
    fn spawn_forwarder(
        &self,
        source: &LocalTrack,
        outputs: Vec<(Option<LayerId>, Arc<TrackLocalStaticSample>)>,
    ) {
        let mut samples = source.subscribe();
        let video = source.kind() == MediaKind::Video;
        let counter = video.then(|| Arc::clone(&self.video_frames));
        let track_id = source.id().to_string();

        // Audio is never paced
        let mut caps = self.caps.subscribe();
        let mut outputs: Vec<_> = outputs
            .into_iter()
            .map(|(layer, output)| {
                let pacer = video.then(|| LayerPacer::for_layer(&caps.borrow(), layer));
                (layer, output, pacer)
            })
            .collect();

        let task = tokio::spawn(async move {
            loop {
                let sample: MediaSample = match samples.recv().await {
                    Ok(sample) => sample,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Forwarder for {} skipped {} samples", track_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let rtc_sample = Sample {
                    data: sample.data.clone(),
                    duration: sample.duration,
                    timestamp: std::time::SystemTime::now(),
                    ..Default::default()
                };

                if caps.has_changed().unwrap_or(false) {
                    let preset = *caps.borrow_and_update();
                    for (layer, _, pacer) in outputs.iter_mut() {
                        if let Some(pacer) = pacer {
                            pacer.set_cap(preset.for_layer(layer.unwrap_or(LayerId::High)));
                        }
                    }
                }

                for (layer, output, pacer) in outputs.iter_mut() {
                    if sample.layer.is_some() && *layer != sample.layer {
                        continue;
                    }
                    if let Some(pacer) = pacer {
                        if !pacer.admit(sample.data.len(), sample.duration) {
                            trace!("Layer {:?} of {} over its cap; sample dropped", layer, track_id);
                            continue;
                        }
                    }
                    if let Err(e) = output.write_sample(&rtc_sample).await {
                        trace!("Dropping sample for {}: {}", track_id, e);
                    }
                }

                if let Some(counter) = &counter {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
            trace!("Forwarder for {} exiting", track_id);
        });

        self.tasks.lock().push(task);
    }

    /// Caps the video forwarders currently pace against
    pub fn caps(&self) -> BitratePreset {
        *self.caps.borrow()
    }

    fn sample_fps(&self) -> f64 {
        let frames = self.video_frames.load(Ordering::Relaxed);
        let now = Instant::now();
        let mut window = self.fps_window.lock();
        let (since, previous) = *window;
        *window = (now, frames);

        let elapsed = now.duration_since(since).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        frames.saturating_sub(previous) as f64 / elapsed
    }
}

#[async_trait]
impl PeerConnectionHandle for WebRtcPeerConnection {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<()> {
        info!(
            "Attaching local {} track {} to generation {}",
            track.kind(),
            track.id(),
            self.generation
        );

        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            self.stream_id.clone(),
        ));

        self.add_sender(Arc::clone(&rtc_track)).await?;
        self.spawn_forwarder(track, vec![(None, rtc_track)]);

        if track.kind() == MediaKind::Video {
            *self.fps_window.lock() = (Instant::now(), self.video_frames.load(Ordering::Relaxed));
        }

        Ok(())
    }

    async fn attach_simulcast_track(
        &self,
        track: &LocalTrack,
        layers: &SimulcastLayers,
    ) -> Result<()> {
        if track.kind() != MediaKind::Video {
            return Err(Error::SimulcastRejected(format!(
                "{} tracks cannot be simulcast",
                track.kind()
            )));
        }

        let outputs: Vec<(Option<LayerId>, Arc<TrackLocalStaticSample>)> = layers
            .layers()
            .iter()
            .map(|layer| {
                let rtc_track = Arc::new(TrackLocalStaticSample::new_with_rid(
                    codec_for(MediaKind::Video),
                    track.id().to_string(),
                    layer.id().rid().to_string(),
                    self.stream_id.clone(),
                ));
                (Some(layer.id()), rtc_track)
            })
            .collect();

        let Some((_, first)) = outputs.first() else {
            return Err(Error::SimulcastRejected("no encodings".to_string()));
        };

        let sender = self.add_sender(Arc::clone(first)).await?;

        for (layer, rtc_track) in outputs.iter().skip(1) {
            if let Err(e) = sender
                .add_encoding(Arc::clone(rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                warn!("Engine refused encoding {:?}: {}", layer, e);
                if let Err(remove_err) = self.pc.remove_track(&sender).await {
                    warn!("Failed to detach partial simulcast sender: {}", remove_err);
                }
                return Err(Error::SimulcastRejected(e.to_string()));
            }
        }

        info!(
            "Attached video track {} with {} simulcast encodings to generation {}",
            track.id(),
            outputs.len(),
            self.generation
        );

        self.spawn_forwarder(track, outputs);
        *self.fps_window.lock() = (Instant::now(), self.video_frames.load(Ordering::Relaxed));

        Ok(())
    }

    async fn apply_encoding_parameters(&self, layers: &SimulcastLayers) -> Result<()> {
        debug!(
            "Generation {} encoding caps: high={} mid={} low={}",
            self.generation,
            layers.layer(LayerId::High).max_bitrate_bps,
            layers.layer(LayerId::Mid).max_bitrate_bps,
            layers.layer(LayerId::Low).max_bitrate_bps
        );
        self.caps.send_replace(layers.bitrates());
        Ok(())
    }

    #[instrument(skip(self), fields(generation = self.generation))]
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::SdpError("No local description after setting offer".to_string())
        })?;

        debug!("Created SDP offer ({} bytes)", local.sdp.len());
        Ok(SessionDescription::offer(local.sdp))
    }

    #[instrument(skip(self), fields(generation = self.generation))]
    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::SdpError("No local description after setting answer".to_string())
        })?;

        debug!("Created SDP answer ({} bytes)", local.sdp.len());
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse remote description: {}", e)))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        debug!(
            "Generation {} applied remote {:?}",
            self.generation, description.kind
        );
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &CandidateDescriptor) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn outbound_video_stats(&self) -> Result<Option<NetworkSample>> {
        let stats = self.pc.get_stats().await;

        let mut found = false;
        let mut sample = NetworkSample::default();

        for report in stats.reports.values() {
            match report {
                StatsReportType::OutboundRTP(rtp) if rtp.kind == "video" => {
                    found = true;
                    sample.bytes_sent += rtp.bytes_sent;
                    sample.packets_sent += rtp.packets_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) if remote.kind == "video" => {
                    sample.packets_lost += remote.packets_lost.max(0) as u64;
                }
                _ => {}
            }
        }

        if !found {
            return Ok(None);
        }

        sample.frames_per_second = self.sample_fps();
        trace!("Generation {} video stats: {:?}", self.generation, sample);
        Ok(Some(sample))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for generation {}", self.generation);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.pc.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codecs() {
        assert_eq!(codec_for(MediaKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(MediaKind::Audio).clock_rate, 48000);
        assert_eq!(codec_for(MediaKind::Video).mime_type, MIME_TYPE_VP8);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(PeerState::Connected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(PeerState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_after_attaching_tracks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = WebRtcEngine::new()
            .create_connection(1, &IceServerConfig::default(), tx)
            .await
            .unwrap();
        assert_eq!(connection.generation(), 1);

        let audio = LocalTrack::new(MediaKind::Audio, "mic");
        let video = LocalTrack::new(MediaKind::Video, "cam");
        connection.attach_track(&audio).await.unwrap();
        connection
            .attach_simulcast_track(&video, &SimulcastLayers::nominal())
            .await
            .unwrap();

        let offer = connection.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_encoding_caps_reach_the_forwarders() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = WebRtcEngine::new()
            .connect(3, &IceServerConfig::default(), tx)
            .await
            .unwrap();
        assert_eq!(connection.caps(), BitratePreset::NOMINAL);

        let video = LocalTrack::new(MediaKind::Video, "cam");
        connection
            .attach_simulcast_track(&video, &SimulcastLayers::nominal())
            .await
            .unwrap();
        connection
            .apply_encoding_parameters(&SimulcastLayers::with_preset(BitratePreset::REDUCED))
            .await
            .unwrap();
        assert_eq!(connection.caps(), BitratePreset::REDUCED);

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_cannot_be_simulcast() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = WebRtcEngine::new()
            .create_connection(2, &IceServerConfig::default(), tx)
            .await
            .unwrap();

        let audio = LocalTrack::new(MediaKind::Audio, "mic");
        let err = connection
            .attach_simulcast_track(&audio, &SimulcastLayers::nominal())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SimulcastRejected(_)));

        connection.close().await.unwrap();
    }
}
