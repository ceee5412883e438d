//! Per-tick bitrate decisions

use crate::adaptation::{BitrateDecision, LossMeasure, NetworkSample};
use crate::config::AdaptationConfig;
use crate::engine::PeerConnectionHandle;
use crate::media::layers::BitratePreset;
use crate::media::pipeline::LayerParameterWriter;
use tracing::{debug, info, warn};

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Statistics were unavailable or empty
    NoStats,
    /// Bitrates left as they were
    Held,
    /// New bitrates were applied
    Applied(BitratePreset),
    /// Sampling or applying failed; nothing changed
    Failed,
}

/// Moves the video layers between the nominal and reduced presets
#[derive(Debug, Clone)]
pub struct AdaptiveBitrateController {
    config: AdaptationConfig,
    previous: Option<NetworkSample>,
}

impl AdaptiveBitrateController {
    pub fn new(config: AdaptationConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    /// Forget the previous sample; called when a new generation starts
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    /// Classify a sample against the thresholds
    pub fn evaluate(&mut self, sample: &NetworkSample) -> BitrateDecision {
        let lost = match (self.config.loss_measure, self.previous) {
            (LossMeasure::PerTick, Some(prev)) => {
                sample.packets_lost.saturating_sub(prev.packets_lost)
            }
            _ => sample.packets_lost,
        };
        self.previous = Some(*sample);

        self.config.thresholds.decide(lost, sample.frames_per_second)
    }

    /// Target caps for a decision, if it calls for a change
    pub fn target_for(&self, decision: BitrateDecision) -> Option<BitratePreset> {
        match decision {
            BitrateDecision::Degrade => Some(self.config.reduced),
            BitrateDecision::Upgrade => Some(self.config.nominal),
            BitrateDecision::Hold => None,
        }
    }

    /// Run one sampling tick
    ///
    /// # Arguments
    ///
    /// * `connection` - Source of outbound video statistics
    /// * `writer` - The generation's layer parameter writer
    pub async fn tick(
        &mut self,
        connection: &dyn PeerConnectionHandle,
        writer: &LayerParameterWriter,
    ) -> TickOutcome {
        let sample = match connection.outbound_video_stats().await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                debug!("No outbound video statistics yet");
                return TickOutcome::NoStats;
            }
            Err(e) if e.is_retryable() => {
                debug!("Statistics not available this tick: {}", e);
                return TickOutcome::Failed;
            }
            Err(e) => {
                warn!("Statistics sampling failed: {}", e);
                return TickOutcome::Failed;
            }
        };

        let decision = self.evaluate(&sample);
        debug!(
            "Video stats: lost={}, fps={:.1}, sent={}B -> {:?}",
            sample.packets_lost, sample.frames_per_second, sample.bytes_sent, decision
        );

        let Some(target) = self.target_for(decision) else {
            return TickOutcome::Held;
        };

        match writer.apply(target).await {
            Ok(true) => {
                info!("Adapted video bitrates ({:?}): {:?}", decision, target);
                TickOutcome::Applied(target)
            }
            Ok(false) => TickOutcome::Held,
            Err(e) => {
                warn!("Failed to apply bitrate change: {}", e);
                TickOutcome::Failed
            }
        }
    }
}
