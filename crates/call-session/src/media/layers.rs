//! Simulcast encoding layers
//!
//! A video sender carries exactly three encodings (`high`, `mid`, `low`).
//! The layer set and each layer's downscale factor are fixed when a
//! connection generation is built; only the bitrate caps change afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one simulcast encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerId {
    /// Full resolution
    High,
    /// ~1.5x downscale
    Mid,
    /// ~3x downscale
    Low,
}

impl LayerId {
    /// All layers, highest quality first
    pub const ALL: [LayerId; 3] = [LayerId::High, LayerId::Mid, LayerId::Low];

    /// RTP stream id used in SDP `a=rid` lines
    pub fn rid(&self) -> &'static str {
        match self {
            LayerId::High => "high",
            LayerId::Mid => "mid",
            LayerId::Low => "low",
        }
    }

    /// Relative-resolution downscale factor
    pub fn scale_resolution_down_by(&self) -> f64 {
        match self {
            LayerId::High => 1.0,
            LayerId::Mid => 1.5,
            LayerId::Low => 3.0,
        }
    }

    fn index(&self) -> usize {
        match self {
            LayerId::High => 0,
            LayerId::Mid => 1,
            LayerId::Low => 2,
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rid())
    }
}

/// Bitrate caps for the three layers, in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitratePreset {
    pub high_bps: u32,
    pub mid_bps: u32,
    pub low_bps: u32,
}

impl BitratePreset {
    /// Nominal caps configured when a generation is created
    pub const NOMINAL: BitratePreset = BitratePreset {
        high_bps: 2_500_000,
        mid_bps: 1_000_000,
        low_bps: 300_000,
    };

    /// Caps used while the network is degraded
    pub const REDUCED: BitratePreset = BitratePreset {
        high_bps: 800_000,
        mid_bps: 400_000,
        low_bps: 150_000,
    };

    /// Cap for a single layer
    pub fn for_layer(&self, layer: LayerId) -> u32 {
        match layer {
            LayerId::High => self.high_bps,
            LayerId::Mid => self.mid_bps,
            LayerId::Low => self.low_bps,
        }
    }
}

/// One encoding of the video sender
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodingLayer {
    id: LayerId,
    scale_resolution_down_by: f64,
    /// Current maximum bitrate in bits per second
    pub max_bitrate_bps: u32,
}

impl EncodingLayer {
    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn scale_resolution_down_by(&self) -> f64 {
        self.scale_resolution_down_by
    }
}

/// The fixed three-layer set of one connection generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulcastLayers {
    layers: [EncodingLayer; 3],
}

impl SimulcastLayers {
    /// Build the layer set with the given bitrate caps
    pub fn with_preset(preset: BitratePreset) -> Self {
        let layers = LayerId::ALL.map(|id| EncodingLayer {
            id,
            scale_resolution_down_by: id.scale_resolution_down_by(),
            max_bitrate_bps: preset.for_layer(id),
        });
        Self { layers }
    }

    /// Layer set at nominal bitrates
    pub fn nominal() -> Self {
        Self::with_preset(BitratePreset::NOMINAL)
    }

    pub fn layers(&self) -> &[EncodingLayer; 3] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> &EncodingLayer {
        &self.layers[id.index()]
    }

    /// Current caps as a preset
    pub fn bitrates(&self) -> BitratePreset {
        BitratePreset {
            high_bps: self.layer(LayerId::High).max_bitrate_bps,
            mid_bps: self.layer(LayerId::Mid).max_bitrate_bps,
            low_bps: self.layer(LayerId::Low).max_bitrate_bps,
        }
    }

    /// Rewrite every layer's cap; returns false when nothing changed
    pub fn apply_preset(&mut self, preset: BitratePreset) -> bool {
        if self.bitrates() == preset {
            return false;
        }
        for layer in self.layers.iter_mut() {
            layer.max_bitrate_bps = preset.for_layer(layer.id);
        }
        true
    }
}

impl Default for SimulcastLayers {
    fn default() -> Self {
        Self::nominal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_layers() {
        let layers = SimulcastLayers::nominal();
        let ids: Vec<LayerId> = layers.layers().iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![LayerId::High, LayerId::Mid, LayerId::Low]);
        assert_eq!(layers.layer(LayerId::High).max_bitrate_bps, 2_500_000);
        assert_eq!(layers.layer(LayerId::Mid).max_bitrate_bps, 1_000_000);
        assert_eq!(layers.layer(LayerId::Low).max_bitrate_bps, 300_000);
        assert_eq!(layers.layer(LayerId::Mid).scale_resolution_down_by(), 1.5);
        assert_eq!(layers.layer(LayerId::Low).scale_resolution_down_by(), 3.0);
    }

    #[test]
    fn test_apply_preset_only_touches_bitrates() {
        let mut layers = SimulcastLayers::nominal();
        assert!(layers.apply_preset(BitratePreset::REDUCED));
        assert_eq!(layers.bitrates(), BitratePreset::REDUCED);
        assert_eq!(layers.layer(LayerId::High).scale_resolution_down_by(), 1.0);
        assert_eq!(layers.layer(LayerId::Low).id(), LayerId::Low);

        // Same preset again is not a change
        assert!(!layers.apply_preset(BitratePreset::REDUCED));
    }

    #[test]
    fn test_layer_rids() {
        assert_eq!(LayerId::High.rid(), "high");
        assert_eq!(LayerId::Low.to_string(), "low");
    }
}
