//! Local media: capture tracks, simulcast layers, per-generation setup

pub mod capture;
pub mod layers;
pub mod pacing;
pub mod pipeline;

pub use capture::{
    CaptureConstraints, CaptureError, CaptureSource, LocalMedia, LocalTrack, MediaKind,
    MediaSample, SyntheticCapture,
};
pub use layers::{BitratePreset, EncodingLayer, LayerId, SimulcastLayers};
pub use pacing::LayerPacer;
pub use pipeline::{ConfiguredGeneration, LayerParameterWriter, MediaPipelineConfigurator};
