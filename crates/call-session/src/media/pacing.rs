//! Per-layer send pacing
//!
//! The engine writes pre-encoded samples, so a layer's bitrate cap is
//! enforced by dropping samples once the layer has spent its budget. Each
//! sample's duration earns `cap / 8` bytes per second of media; a sample is
//! sent while the budget is positive and its size is then charged, which
//! may leave the budget in debt. The budget never holds more than one
//! second of credit.

use crate::media::layers::{BitratePreset, LayerId};
use std::time::Duration;

/// Byte budget for one simulcast layer
#[derive(Debug, Clone)]
pub struct LayerPacer {
    cap_bps: u32,
    budget: f64,
}

impl LayerPacer {
    pub fn new(cap_bps: u32) -> Self {
        Self { cap_bps, budget: 0.0 }
    }

    /// Pacer for one layer of a preset; `None` paces at the high layer cap
    pub fn for_layer(preset: &BitratePreset, layer: Option<LayerId>) -> Self {
        Self::new(preset.for_layer(layer.unwrap_or(LayerId::High)))
    }

    pub fn cap_bps(&self) -> u32 {
        self.cap_bps
    }

    /// Change the cap; credit above the new one-second ceiling is forfeited
    pub fn set_cap(&mut self, cap_bps: u32) {
        self.cap_bps = cap_bps;
        self.budget = self.budget.min(self.ceiling());
    }

    /// Whether a sample of `len` bytes covering `duration` may be sent
    pub fn admit(&mut self, len: usize, duration: Duration) -> bool {
        let earned = self.cap_bps as f64 / 8.0 * duration.as_secs_f64();
        self.budget = (self.budget + earned).min(self.ceiling());

        if self.budget <= 0.0 {
            return false;
        }
        self.budget -= len as f64;
        true
    }

    fn ceiling(&self) -> f64 {
        self.cap_bps as f64 / 8.0
    }
}
