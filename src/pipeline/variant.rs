//! Pipeline variants, cached stages, swap policy and residency.

use serde::{Deserialize, Serialize};

/// One of the independently cached pipeline variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Base,
    Refiner,
    Inpainter,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Base, Variant::Refiner, Variant::Inpainter];

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Base => "base",
            Variant::Refiner => "refiner",
            Variant::Inpainter => "inpainter",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Variant::Base => 0,
            Variant::Refiner => 1,
            Variant::Inpainter => 2,
        }
    }
}

/// A separately compiled stage of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "clip")]
    TextEncoder,
    #[serde(rename = "unet")]
    Denoiser,
    #[serde(rename = "controlledunet")]
    ControlledDenoiser,
    #[serde(rename = "vae")]
    Decoder,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::TextEncoder,
        Stage::Denoiser,
        Stage::ControlledDenoiser,
        Stage::Decoder,
    ];

    /// Directory name under the engine cache.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::TextEncoder => "clip",
            Stage::Denoiser => "unet",
            Stage::ControlledDenoiser => "controlledunet",
            Stage::Decoder => "vae",
        }
    }

    /// Whether auxiliary weights are compiled into this stage.
    pub fn carries_weights(self) -> bool {
        !matches!(self, Stage::Decoder)
    }
}

/// What to do with the variant that is not needed for the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapPolicy {
    /// Move to host memory, restore on next use.
    #[default]
    Offload,
    /// Destroy; rebuilt on next use.
    Unload,
    /// Keep everything resident.
    #[serde(rename = "none")]
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    OnDevice,
    OnHost,
}

/// Externally visible lifecycle of one variant's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Unloaded,
    Loading,
    Loaded,
    Offloaded,
}
