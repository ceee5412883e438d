//! Configuration types for call sessions

use crate::adaptation::{AdaptationThresholds, LossMeasure};
use crate::media::capture::CaptureConstraints;
use crate::media::layers::{BitratePreset, LayerId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a [`CallSession`](crate::session::CallSession)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSessionConfig {
    /// Signaling relay base URL (ws:// or wss://)
    pub signaling_url: String,

    /// Adaptive bitrate settings
    pub adaptation: AdaptationConfig,

    /// Send video as three simulcast encodings (default: true)
    pub simulcast_enabled: bool,

    /// Upper bound on candidates buffered before the remote description
    /// (default: 64)
    pub max_pending_candidates: usize,

    /// Terminate when negotiation has not completed this long after the
    /// offer (default: disabled)
    pub negotiation_timeout_ms: Option<u64>,

    /// Local capture request
    pub capture: CaptureConstraints,
}

/// Adaptive bitrate controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// Run the controller at all (default: true)
    pub enabled: bool,

    /// Sampling period in milliseconds (default: 3000, range: 500-60000)
    pub interval_ms: u64,

    /// Degrade/upgrade thresholds
    pub thresholds: AdaptationThresholds,

    /// Caps applied at generation start and on upgrade
    pub nominal: BitratePreset,

    /// Caps applied on degrade
    pub reduced: BitratePreset,

    /// How packet loss is compared against the thresholds
    pub loss_measure: LossMeasure,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 3000,
            thresholds: AdaptationThresholds::default(),
            nominal: BitratePreset::NOMINAL,
            reduced: BitratePreset::REDUCED,
            loss_measure: LossMeasure::Cumulative,
        }
    }
}

impl AdaptationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for CallSessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8000".to_string(),
            adaptation: AdaptationConfig::default(),
            simulcast_enabled: true,
            max_pending_candidates: 64,
            negotiation_timeout_ms: None,
            capture: CaptureConstraints::default(),
        }
    }
}

impl CallSessionConfig {
    /// Create a new configuration with the given signaling URL
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        let adaptation = &self.adaptation;
        if adaptation.interval_ms < 500 || adaptation.interval_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "adaptation.interval_ms must be in range 500-60000, got {}",
                adaptation.interval_ms
            )));
        }

        for layer in LayerId::ALL {
            let reduced = adaptation.reduced.for_layer(layer);
            let nominal = adaptation.nominal.for_layer(layer);
            if reduced == 0 || reduced > nominal {
                return Err(Error::InvalidConfig(format!(
                    "reduced bitrate for layer {} must be in range 1-{}, got {}",
                    layer, nominal, reduced
                )));
            }
        }

        if !adaptation.thresholds.has_hysteresis_gap() {
            return Err(Error::InvalidConfig(
                "upgrade thresholds must lie inside the non-degrade band".to_string(),
            ));
        }

        if self.max_pending_candidates == 0 {
            return Err(Error::InvalidConfig(
                "max_pending_candidates must be at least 1".to_string(),
            ));
        }

        if self.negotiation_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be positive when set".to_string(),
            ));
        }

        if !self.capture.audio && !self.capture.video {
            return Err(Error::InvalidConfig(
                "capture must request audio, video, or both".to_string(),
            ));
        }

        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_ms.map(Duration::from_millis)
    }

    /// Preset for constrained links
    ///
    /// Lower capture resolution, halved caps, faster sampling and a
    /// negotiation timeout.
    pub fn low_bandwidth_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            adaptation: AdaptationConfig {
                enabled: true,
                interval_ms: 2000,
                thresholds: AdaptationThresholds::default(),
                nominal: BitratePreset {
                    high_bps: 1_200_000,
                    mid_bps: 500_000,
                    low_bps: 150_000,
                },
                reduced: BitratePreset {
                    high_bps: 400_000,
                    mid_bps: 200_000,
                    low_bps: 80_000,
                },
                loss_measure: LossMeasure::PerTick,
            },
            simulcast_enabled: true,
            max_pending_candidates: 64,
            negotiation_timeout_ms: Some(30_000),
            capture: CaptureConstraints {
                audio: true,
                video: true,
                width: 640,
                height: 360,
                frame_rate: 24,
            },
        }
    }

    /// Preset for good links: 1080p capture, default caps
    pub fn high_quality_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            adaptation: AdaptationConfig::default(),
            simulcast_enabled: true,
            max_pending_candidates: 128,
            negotiation_timeout_ms: None,
            capture: CaptureConstraints {
                audio: true,
                video: true,
                width: 1920,
                height: 1080,
                frame_rate: 30,
            },
        }
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_adaptation(mut self, adaptation: AdaptationConfig) -> Self {
        self.adaptation = adaptation;
        self
    }
}
