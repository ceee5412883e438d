//! Adaptive bitrate control
//!
//! Once a connection generation exists, a fixed-period ticker samples the
//! outbound video statistics and moves all three simulcast layers between
//! the nominal and reduced bitrate presets. The decision uses a hysteresis
//! band so that a moderately lossy link neither degrades nor upgrades.

pub mod controller;
pub mod ticker;

pub use controller::{AdaptiveBitrateController, TickOutcome};
pub use ticker::AdaptationTicker;

use serde::{Deserialize, Serialize};

/// Outbound video transport statistics for one tick
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkSample {
    /// Cumulative bytes sent
    pub bytes_sent: u64,

    /// Cumulative packets sent
    pub packets_sent: u64,

    /// Cumulative packets reported lost by the remote side
    pub packets_lost: u64,

    /// Instantaneous encoded frames per second
    pub frames_per_second: f64,
}

/// How the packet-loss threshold is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossMeasure {
    /// Compare the cumulative counter reported by the engine
    #[default]
    Cumulative,

    /// Compare the packets lost since the previous sample
    PerTick,
}

/// Outcome of evaluating one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateDecision {
    /// Move to the reduced preset
    Degrade,
    /// Move to the nominal preset
    Upgrade,
    /// Keep the current bitrates
    Hold,
}

/// Degrade/upgrade thresholds
///
/// Degrade when `packets_lost > degrade_packets_lost` or
/// `fps < degrade_min_fps`. Upgrade when
/// `packets_lost < upgrade_max_packets_lost` and `fps > upgrade_min_fps`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptationThresholds {
    pub degrade_packets_lost: u64,
    pub degrade_min_fps: f64,
    pub upgrade_max_packets_lost: u64,
    pub upgrade_min_fps: f64,
}

impl Default for AdaptationThresholds {
    fn default() -> Self {
        Self {
            degrade_packets_lost: 20,
            degrade_min_fps: 10.0,
            upgrade_max_packets_lost: 5,
            upgrade_min_fps: 25.0,
        }
    }
}

impl AdaptationThresholds {
    /// Classify a loss/fps pair
    ///
    /// Degrade wins when both conditions could apply.
    pub fn decide(&self, packets_lost: u64, frames_per_second: f64) -> BitrateDecision {
        if packets_lost > self.degrade_packets_lost || frames_per_second < self.degrade_min_fps {
            BitrateDecision::Degrade
        } else if packets_lost < self.upgrade_max_packets_lost
            && frames_per_second > self.upgrade_min_fps
        {
            BitrateDecision::Upgrade
        } else {
            BitrateDecision::Hold
        }
    }

    /// True when the upgrade band lies strictly inside the non-degrade region
    pub fn has_hysteresis_gap(&self) -> bool {
        self.upgrade_max_packets_lost <= self.degrade_packets_lost
            && self.upgrade_min_fps >= self.degrade_min_fps
    }
}
