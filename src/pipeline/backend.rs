//! Seam between the resource manager and whatever runs inference.
//!
//! The manager decides what to build, where it lives and when it dies; a
//! [`PipelineBackend`] only knows how to build one pipeline and run it.

use std::path::{Path, PathBuf};

use image::DynamicImage;

use super::settings::{AuxiliaryWeight, Controlnet, Placement, Precision, Scheduler, VaeChoice, WeightKind};
use super::variant::{Stage, Variant};
use crate::error::{EngineError, Result};

/// Seeded noise source handed to every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generator {
    seed: u64,
    state: u64,
}

impl Generator {
    pub fn new(seed: u64) -> Self {
        Self { seed, state: seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// splitmix64
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// Where the weights for a construction come from, best first.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstructionSource {
    /// Compiled engine directories, one per accelerated stage, plus the snapshot for the rest.
    Accelerated {
        snapshot: PathBuf,
        engines: Vec<(Stage, PathBuf)>,
    },
    /// A previously converted snapshot directory.
    Pretrained { snapshot: PathBuf },
    /// A raw checkpoint file that must be converted.
    Checkpoint { path: PathBuf },
}

impl ConstructionSource {
    pub fn is_accelerated(&self) -> bool {
        matches!(self, ConstructionSource::Accelerated { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstructionSpec {
    pub variant: Variant,
    pub model: String,
    pub source: ConstructionSource,
    pub engine_size: u32,
    pub chunking_size: u32,
    pub chunking_blur: u32,
    pub precision: Precision,
    /// Attach a safety checker; without one nothing is ever flagged.
    pub safe: bool,
    pub is_xl: bool,
    pub controlnet: Option<Controlnet>,
}

/// One denoising step report.
#[derive(Debug, Clone)]
pub struct StepProgress {
    pub step: u32,
    pub total: u32,
    /// Steps per second.
    pub rate: Option<f64>,
    pub images: Option<Vec<DynamicImage>>,
}

/// Arguments for one pipeline call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub strength: Option<f32>,
    pub aesthetic_score: Option<f32>,
    pub negative_aesthetic_score: Option<f32>,
    pub num_images: u32,
    pub image: Option<DynamicImage>,
    pub mask: Option<DynamicImage>,
    pub chunking_size: u32,
    pub chunking_blur: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub images: Vec<DynamicImage>,
    /// One flag per image; flagged images are blanked by the safety checker.
    pub nsfw_content_detected: Vec<bool>,
}

impl PipelineOutput {
    pub fn is_nsfw(&self, index: usize) -> bool {
        self.nsfw_content_detected.get(index).copied().unwrap_or(false)
    }
}

/// A constructed pipeline for one variant.
pub trait DiffusionPipeline: Send {
    fn call(
        &mut self,
        generator: &mut Generator,
        args: &CallArgs,
        progress: &mut dyn FnMut(StepProgress),
    ) -> Result<PipelineOutput>;

    /// Load one fine-tuning weight from `path` into the pipeline.
    fn apply_auxiliary_weights(&mut self, kind: WeightKind, weight: &AuxiliaryWeight, path: &Path) -> Result<()>;

    /// Move to the device or host memory at the given precision.
    fn to(&mut self, placement: Placement, precision: Precision) -> Result<()>;

    fn set_scheduler(&mut self, scheduler: Scheduler) -> Result<()>;

    fn set_multi_scheduler(&mut self, scheduler: Scheduler) -> Result<()>;

    fn set_vae(&mut self, vae: VaeChoice) -> Result<()>;

    /// Change the nominal resolution of a non-compiled pipeline.
    fn set_engine_size(&mut self, size: u32) -> Result<()>;

    fn set_chunking(&mut self, size: u32, blur: u32);

    /// Persist the converted weights as a snapshot directory.
    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}

pub trait PipelineBackend: Send {
    type Pipeline: DiffusionPipeline;

    /// Whether compiled engines can be built and run on this machine.
    fn supports_accelerated_engine(&self) -> bool;

    /// Build a pipeline. With an accelerated source, missing engine plans are compiled first.
    fn construct(&mut self, spec: &ConstructionSpec) -> Result<Self::Pipeline>;

    /// Derive an inpainting checkpoint from a base checkpoint.
    fn create_inpainting_checkpoint(&mut self, source: &Path, target: &Path) -> Result<()> {
        Err(EngineError::Pipeline(format!(
            "backend cannot create inpainting checkpoint {} from {}",
            target.display(),
            source.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_is_deterministic() {
        let mut a = Generator::new(42);
        let mut b = Generator::new(42);
        let first: Vec<u64> = (0..4).map(|_| a.next_u64()).collect();
        let second: Vec<u64> = (0..4).map(|_| b.next_u64()).collect();
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
        assert_eq!(a.seed(), 42);
        assert_ne!(Generator::new(43).next_u64(), first[0]);
    }

    #[test]
    fn test_nsfw_flag_lookup() {
        let output = PipelineOutput {
            images: Vec::new(),
            nsfw_content_detected: vec![false, true],
        };
        assert!(output.is_nsfw(1));
        assert!(!output.is_nsfw(0));
        assert!(!output.is_nsfw(5));
    }
}
