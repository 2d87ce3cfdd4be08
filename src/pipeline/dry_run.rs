//! In-process backend that produces flat-colour images.
//!
//! Used by the binary when no native backend is linked, and by tests to
//! observe what the manager asked for.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use image::{DynamicImage, Rgb, RgbImage};
use serde_json::json;

use super::backend::{
    CallArgs, ConstructionSource, ConstructionSpec, DiffusionPipeline, Generator, PipelineBackend,
    PipelineOutput, StepProgress,
};
use super::layout::CacheLayout;
use super::settings::{AuxiliaryWeight, Placement, Precision, Scheduler, VaeChoice, WeightKind};
use super::variant::Variant;
use crate::error::{EngineError, Result};
use crate::log_debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Accelerated,
    Pretrained,
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstructionRecord {
    pub variant: Variant,
    pub model: String,
    pub source: SourceKind,
    pub engine_size: u32,
    pub safe: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub variant: Variant,
    pub accelerated: bool,
    pub width: u32,
    pub height: u32,
    pub strength: Option<f32>,
    /// Size of the input image, if any.
    pub input_size: Option<(u32, u32)>,
}

/// Knobs and observations shared between a backend and its pipelines.
#[derive(Debug, Clone)]
pub struct DryRunState {
    pub accelerated_supported: bool,
    /// Per-image safety flags, repeated cyclically.
    pub nsfw: Vec<bool>,
    pub fail_calls: bool,
    pub steps: u32,

    pub constructions: Vec<ConstructionRecord>,
    pub calls: Vec<CallRecord>,
    pub placements: Vec<(Variant, Placement)>,
    pub weights: Vec<(Variant, WeightKind, String)>,
    pub schedulers: Vec<(Variant, Scheduler)>,
    pub vaes: Vec<(Variant, VaeChoice)>,
    pub chunking: Vec<(Variant, u32, u32)>,
}

impl Default for DryRunState {
    fn default() -> Self {
        Self {
            accelerated_supported: false,
            nsfw: Vec::new(),
            fail_calls: false,
            steps: 4,
            constructions: Vec::new(),
            calls: Vec::new(),
            placements: Vec::new(),
            weights: Vec::new(),
            schedulers: Vec::new(),
            vaes: Vec::new(),
            chunking: Vec::new(),
        }
    }
}

/// Clonable view of a [`DryRunBackend`]'s state.
#[derive(Debug, Clone, Default)]
pub struct DryRunHandle(Arc<Mutex<DryRunState>>);

impl DryRunHandle {
    pub fn lock(&self) -> MutexGuard<'_, DryRunState> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Default)]
pub struct DryRunBackend {
    handle: DryRunHandle,
}

impl DryRunBackend {
    pub fn new(state: DryRunState) -> Self {
        Self {
            handle: DryRunHandle(Arc::new(Mutex::new(state))),
        }
    }

    pub fn handle(&self) -> DryRunHandle {
        self.handle.clone()
    }
}

fn colour_of(variant: Variant) -> Rgb<u8> {
    match variant {
        Variant::Base => Rgb([200, 40, 40]),
        Variant::Refiner => Rgb([40, 200, 40]),
        Variant::Inpainter => Rgb([40, 40, 200]),
    }
}

impl PipelineBackend for DryRunBackend {
    type Pipeline = DryRunPipeline;

    fn supports_accelerated_engine(&self) -> bool {
        self.handle.lock().accelerated_supported
    }

    fn construct(&mut self, spec: &ConstructionSpec) -> Result<DryRunPipeline> {
        let source = match &spec.source {
            ConstructionSource::Accelerated { engines, .. } => {
                for (stage, dir) in engines {
                    let plan = CacheLayout::engine_plan(dir);
                    if !plan.exists() {
                        log_debug!("dry-run", "Compiling {} engine into {}", stage.dir_name(), dir.display());
                        fs::create_dir_all(dir)?;
                        fs::write(&plan, b"dry-run engine")?;
                    }
                }
                SourceKind::Accelerated
            }
            ConstructionSource::Pretrained { .. } => SourceKind::Pretrained,
            ConstructionSource::Checkpoint { .. } => SourceKind::Checkpoint,
        };

        self.handle.lock().constructions.push(ConstructionRecord {
            variant: spec.variant,
            model: spec.model.clone(),
            source,
            engine_size: spec.engine_size,
            safe: spec.safe,
        });

        Ok(DryRunPipeline {
            variant: spec.variant,
            model: spec.model.clone(),
            is_xl: spec.is_xl,
            safe: spec.safe,
            accelerated: spec.source.is_accelerated(),
            handle: self.handle.clone(),
        })
    }

    fn create_inpainting_checkpoint(&mut self, source: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, format!("inpainting weights derived from {}", source.display()))?;
        Ok(())
    }
}

pub struct DryRunPipeline {
    variant: Variant,
    model: String,
    is_xl: bool,
    safe: bool,
    accelerated: bool,
    handle: DryRunHandle,
}

impl DiffusionPipeline for DryRunPipeline {
    fn call(
        &mut self,
        generator: &mut Generator,
        args: &CallArgs,
        progress: &mut dyn FnMut(StepProgress),
    ) -> Result<PipelineOutput> {
        let (fail, steps, nsfw) = {
            let mut state = self.handle.lock();
            state.calls.push(CallRecord {
                variant: self.variant,
                accelerated: self.accelerated,
                width: args.width,
                height: args.height,
                strength: args.strength,
                input_size: args.image.as_ref().map(|i| (i.width(), i.height())),
            });
            (state.fail_calls, state.steps.max(1), state.nsfw.clone())
        };
        if fail {
            return Err(EngineError::Pipeline(format!("{} call failed", self.variant.as_str())));
        }

        let (width, height) = match &args.image {
            Some(image) => (image.width(), image.height()),
            None => (args.width, args.height),
        };
        let frame = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, colour_of(self.variant)));

        for step in 1..=steps {
            let _ = generator.next_u64();
            progress(StepProgress {
                step,
                total: steps,
                rate: Some(1.0),
                images: (step == steps).then(|| vec![frame.clone()]),
            });
        }

        let count = args.num_images.max(1) as usize;
        Ok(PipelineOutput {
            images: vec![frame; count],
            nsfw_content_detected: (0..count)
                .map(|i| self.safe && !nsfw.is_empty() && nsfw[i % nsfw.len()])
                .collect(),
        })
    }

    fn apply_auxiliary_weights(&mut self, kind: WeightKind, weight: &AuxiliaryWeight, _path: &Path) -> Result<()> {
        self.handle.lock().weights.push((self.variant, kind, weight.name.clone()));
        Ok(())
    }

    fn to(&mut self, placement: Placement, _precision: Precision) -> Result<()> {
        self.handle.lock().placements.push((self.variant, placement));
        Ok(())
    }

    fn set_scheduler(&mut self, scheduler: Scheduler) -> Result<()> {
        self.handle.lock().schedulers.push((self.variant, scheduler));
        Ok(())
    }

    fn set_multi_scheduler(&mut self, scheduler: Scheduler) -> Result<()> {
        self.handle.lock().schedulers.push((self.variant, scheduler));
        Ok(())
    }

    fn set_vae(&mut self, vae: VaeChoice) -> Result<()> {
        self.handle.lock().vaes.push((self.variant, vae));
        Ok(())
    }

    fn set_engine_size(&mut self, _size: u32) -> Result<()> {
        Ok(())
    }

    fn set_chunking(&mut self, size: u32, blur: u32) {
        self.handle.lock().chunking.push((self.variant, size, blur));
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let index = json!({"_class_name": "DryRunPipeline", "model": self.model});
        fs::write(dir.join("model_index.json"), serde_json::to_vec_pretty(&index)?)?;
        if self.is_xl {
            fs::create_dir_all(dir.join("text_encoder_2"))?;
        }
        Ok(())
    }
}
