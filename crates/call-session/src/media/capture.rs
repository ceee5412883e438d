//! Local capture tracks
//!
//! A [`CaptureSource`] hands the session a [`LocalMedia`] bundle of
//! [`LocalTrack`]s. Tracks are cheap handles: the source pushes encoded
//! samples into a track, the engine adapter subscribes to them, and the
//! session publishes the current per-layer bitrate targets back so an
//! encoder can follow the adaptive controller.

use crate::media::layers::{BitratePreset, LayerId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace};

/// Capacity of each track's sample fan-out
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// What to request from the capture device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Capture a microphone track
    pub audio: bool,

    /// Capture a camera track
    pub video: bool,

    /// Ideal video width in pixels
    pub width: u32,

    /// Ideal video height in pixels
    pub height: u32,

    /// Ideal video frame rate
    pub frame_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Reasons local capture can fail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The user or platform refused access
    #[error("permission to capture media was denied")]
    PermissionDenied,

    /// No device matches the requested kinds
    #[error("no capture device found")]
    DeviceNotFound,

    /// The device exists but is in use elsewhere
    #[error("capture device is busy")]
    DeviceBusy,

    /// The constraints cannot be satisfied
    #[error("constraint cannot be satisfied: {0}")]
    Overconstrained(String),

    /// Capture is blocked in the current context
    #[error("capture blocked by security policy")]
    SecurityRestriction,

    #[error("capture failed: {0}")]
    Other(String),
}

/// One encoded media sample
#[derive(Debug, Clone)]
pub struct MediaSample {
    /// Encoded payload
    pub data: Bytes,

    /// Media time covered by this sample
    pub duration: Duration,

    /// Simulcast layer this sample belongs to; `None` feeds every layer
    pub layer: Option<LayerId>,
}

struct LocalTrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    stopped: AtomicBool,
    samples: broadcast::Sender<MediaSample>,
    targets: watch::Sender<Option<BitratePreset>>,
}

/// A locally captured audio or video track
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    /// Create a running track
    ///
    /// # Arguments
    ///
    /// * `kind` - Audio or video
    /// * `label` - Human readable device label
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        let (targets, _) = watch::channel(None);

        Self {
            inner: Arc::new(LocalTrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                stopped: AtomicBool::new(false),
                samples,
                targets,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the track
    ///
    /// Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        let was_running = !self.inner.stopped.swap(true, Ordering::AcqRel);
        if was_running {
            debug!("Stopped local {} track {}", self.inner.kind, self.inner.id);
        }
        was_running
    }

    /// Push an encoded sample to every subscriber
    ///
    /// Returns `false` once the track is stopped.
    pub fn push_sample(&self, sample: MediaSample) -> bool {
        if self.is_stopped() {
            return false;
        }
        // No subscribers yet is not an error
        let _ = self.inner.samples.send(sample);
        true
    }

    /// Subscribe to samples pushed after this call
    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }

    /// Publish the bitrate targets the encoder should follow
    pub fn publish_targets(&self, targets: BitratePreset) {
        self.inner.targets.send_replace(Some(targets));
    }

    /// Latest published targets, if any
    pub fn current_targets(&self) -> Option<BitratePreset> {
        *self.inner.targets.borrow()
    }

    /// Watch target changes
    pub fn watch_targets(&self) -> watch::Receiver<Option<BitratePreset>> {
        self.inner.targets.subscribe()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The tracks produced by one successful capture
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Video)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop every track; returns how many were still running
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Provider of local audio/video
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Acquire local tracks matching the constraints
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CaptureError>;
}

/// Capture source that fabricates samples at a fixed cadence
///
/// Payloads are opaque filler bytes. It stands in for a device when none is
/// available (headless clients, tests). Video frames are resized to the
/// high layer's published bitrate target, the way an encoder would follow
/// the adaptive controller.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    pump: bool,
}

impl SyntheticCapture {
    /// Synthetic source that keeps pushing samples until its tracks stop
    pub fn new() -> Self {
        Self { pump: true }
    }

    /// Synthetic source whose tracks never carry samples
    pub fn silent() -> Self {
        Self { pump: false }
    }

    fn spawn_pump(
        track: LocalTrack,
        interval: Duration,
        payload_len: usize,
        follow_targets: bool,
    ) {
        let mut targets = follow_targets.then(|| track.watch_targets());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut payload = Bytes::from(vec![0u8; payload_len]);
            loop {
                ticker.tick().await;

                if let Some(targets) = targets.as_mut() {
                    if targets.has_changed().unwrap_or(false) {
                        if let Some(preset) = *targets.borrow_and_update() {
                            let len = frame_bytes(preset.high_bps, interval);
                            debug!("Synthetic video {} now {} bytes per frame", track.id(), len);
                            payload = Bytes::from(vec![0u8; len]);
                        }
                    }
                }

                let sample = MediaSample {
                    data: payload.clone(),
                    duration: interval,
                    layer: None,
                };
                if !track.push_sample(sample) {
                    trace!("Synthetic pump for {} exiting", track.id());
                    break;
                }
            }
        });
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes per frame that spend `bitrate_bps` at one frame per `interval`
fn frame_bytes(bitrate_bps: u32, interval: Duration) -> usize {
    ((bitrate_bps as f64 / 8.0 * interval.as_secs_f64()) as usize).max(1)
}

#[async_trait]
impl CaptureSource for SyntheticCapture {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CaptureError> {
        if !constraints.audio && !constraints.video {
            return Err(CaptureError::Overconstrained(
                "neither audio nor video requested".to_string(),
            ));
        }
        if constraints.video && constraints.frame_rate == 0 {
            return Err(CaptureError::Overconstrained("frame_rate".to_string()));
        }

        let mut tracks = Vec::new();

        if constraints.audio {
            let track = LocalTrack::new(MediaKind::Audio, "synthetic-microphone");
            if self.pump {
                // 20ms Opus frames
                Self::spawn_pump(track.clone(), Duration::from_millis(20), 160, false);
            }
            tracks.push(track);
        }

        if constraints.video {
            let track = LocalTrack::new(MediaKind::Video, "synthetic-camera");
            if self.pump {
                let interval = Duration::from_secs(1) / constraints.frame_rate;
                let payload_len = (constraints.width * constraints.height / 64) as usize;
                Self::spawn_pump(track.clone(), interval, payload_len.max(1), true);
            }
            tracks.push(track);
        }

        info!(
            "Acquired synthetic capture: audio={}, video={} ({}x{}@{})",
            constraints.audio,
            constraints.video,
            constraints.width,
            constraints.height,
            constraints.frame_rate
        );

        Ok(LocalMedia::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_reported_once() {
        let track = LocalTrack::new(MediaKind::Video, "cam");
        assert!(!track.is_stopped());
        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.is_stopped());
    }

    #[test]
    fn test_stop_all_counts_running_tracks() {
        let audio = LocalTrack::new(MediaKind::Audio, "mic");
        let video = LocalTrack::new(MediaKind::Video, "cam");
        audio.stop();

        let media = LocalMedia::new(vec![audio, video]);
        assert_eq!(media.stop_all(), 1);
        assert_eq!(media.stop_all(), 0);
    }

    #[test]
    fn test_push_after_stop_is_refused() {
        let track = LocalTrack::new(MediaKind::Audio, "mic");
        let mut rx = track.subscribe();
        let sample = MediaSample {
            data: Bytes::from_static(b"abc"),
            duration: Duration::from_millis(20),
            layer: None,
        };

        assert!(track.push_sample(sample.clone()));
        assert_eq!(rx.try_recv().map(|s| s.data.len()).ok(), Some(3));

        track.stop();
        assert!(!track.push_sample(sample));
    }

    #[test]
    fn test_published_targets_are_visible() {
        let track = LocalTrack::new(MediaKind::Video, "cam");
        assert_eq!(track.current_targets(), None);
        track.publish_targets(BitratePreset::REDUCED);
        assert_eq!(track.current_targets(), Some(BitratePreset::REDUCED));
    }

    #[tokio::test]
    async fn test_synthetic_capture_kinds() {
        let media = SyntheticCapture::silent()
            .acquire(&CaptureConstraints {
                audio: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(media.audio().is_none());
        assert!(media.video().is_some());
    }

    #[tokio::test]
    async fn test_synthetic_capture_rejects_empty_request() {
        let err = SyntheticCapture::silent()
            .acquire(&CaptureConstraints {
                audio: false,
                video: false,
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::Overconstrained(_)));
    }

    #[tokio::test]
    async fn test_synthetic_pump_produces_samples() {
        let media = SyntheticCapture::new()
            .acquire(&CaptureConstraints {
                video: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let audio = media.audio().unwrap().clone();
        let mut rx = audio.subscribe();
        let sample = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.data.len(), 160);

        media.stop_all();
    }

    #[tokio::test]
    async fn test_synthetic_video_follows_targets() {
        let media = SyntheticCapture::new()
            .acquire(&CaptureConstraints {
                audio: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let video = media.video().unwrap().clone();
        let mut rx = video.subscribe();
        video.publish_targets(BitratePreset::REDUCED);

        // 800 kbps at 30 fps
        let expected = frame_bytes(800_000, Duration::from_secs(1) / 30);
        assert_eq!(expected, 3_333);
        let resized = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(sample) = rx.recv().await {
                    if sample.data.len() == expected {
                        return true;
                    }
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(resized);

        media.stop_all();
    }
}
