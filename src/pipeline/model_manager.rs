//! Per-variant pipeline lifecycle.
//!
//! Each variant owns a lazily constructed pipeline. Configuration changes go
//! through [`PipelineManager::apply_configuration`], which consults a table
//! of field effects to decide whether a loaded pipeline is patched in place
//! or thrown away.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::backend::{ConstructionSource, ConstructionSpec, DiffusionPipeline, Generator, PipelineBackend};
use super::cache_key::CacheKey;
use super::keepalive::Heartbeat;
use super::layout::{CacheLayout, EngineKind, StageMetadata};
use super::lazy::{Lazy, LazyState};
use super::settings::{
    AuxiliaryWeight, ConfigurationUpdate, Device, Placement, Precision, WeightKind,
};
use super::status::{self, EngineStatus, EngineStatusQuery};
use super::variant::{PipelineState, Residency, Stage, SwapPolicy, Variant};
use crate::config::{EngineConfig, EnginePaths, DEFAULT_SIZE, DEFAULT_XL_SIZE};
use crate::error::{EngineError, Result};
use crate::{log_debug, log_info, log_warn};

/// A constructed pipeline and what it was built from.
pub(super) struct PipelineInstance<P> {
    pub(super) pipeline: P,
    pub(super) residency: Residency,
    pub(super) accelerated: bool,
    /// Compiled stages and their keys; empty when not accelerated.
    pub(super) engines: Vec<(Stage, CacheKey)>,
    pub(super) serial: u64,
}

impl<P> PipelineInstance<P> {
    fn compiles(&self, stage: Stage) -> bool {
        self.engines.iter().any(|(s, _)| *s == stage)
    }
}

/// A configuration field, as named in the effect table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Model,
    Refiner,
    Inpainter,
    Size,
    RefinerSize,
    InpainterSize,
    ChunkingSize,
    ChunkingBlur,
    Lora,
    Lycoris,
    Inversion,
    Precision,
    Device,
    Safe,
    Scheduler,
    MultiScheduler,
    Vae,
    Controlnet,
    Seed,
    BuildAccelerated,
    AcceleratedEnabled,
    PipelineSwitch,
    RefinerDefaults,
}

/// What a changed field does to the variants it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    /// Participates in a cache key or in construction: rebuild.
    Unload,
    /// Unload only if the resolved weight source changed.
    SourceChanged,
    /// Rebuild compiled pipelines; resize others in place.
    Resize,
    /// Patch the loaded pipeline.
    HotSwap,
    /// Patch when set. A cleared field is treated as `Unload`.
    HotSwapOrUnload,
    /// Patch unless the decoder is compiled.
    Decoder,
    /// Unload if the accelerated decision flipped.
    AcceleratedPath,
    /// Discard the generator.
    Reseed,
    /// Read at call time only.
    Stored,
}

const ALL: &[Variant] = &Variant::ALL;
const BASE: &[Variant] = &[Variant::Base];
const REFINER: &[Variant] = &[Variant::Refiner];
const INPAINTER: &[Variant] = &[Variant::Inpainter];
const BASE_AND_INPAINTER: &[Variant] = &[Variant::Base, Variant::Inpainter];
const NONE: &[Variant] = &[];

/// Field -> (affected variants, effect).
const RULES: &[(Field, &[Variant], Effect)] = &[
    // The inpainter falls back to a checkpoint derived from the base model
    (Field::Model, BASE_AND_INPAINTER, Effect::SourceChanged),
    (Field::Refiner, REFINER, Effect::SourceChanged),
    (Field::Inpainter, INPAINTER, Effect::SourceChanged),
    // Refiner and inpainter sizes may derive from the base size
    (Field::Size, ALL, Effect::Resize),
    (Field::RefinerSize, REFINER, Effect::Resize),
    (Field::InpainterSize, INPAINTER, Effect::Resize),
    (Field::ChunkingSize, ALL, Effect::HotSwap),
    (Field::ChunkingBlur, ALL, Effect::HotSwap),
    (Field::Lora, ALL, Effect::Unload),
    (Field::Lycoris, ALL, Effect::Unload),
    (Field::Inversion, ALL, Effect::Unload),
    (Field::Precision, ALL, Effect::Unload),
    (Field::Device, ALL, Effect::Unload),
    (Field::Safe, BASE_AND_INPAINTER, Effect::Unload),
    (Field::Controlnet, BASE, Effect::Unload),
    (Field::Scheduler, ALL, Effect::HotSwapOrUnload),
    (Field::MultiScheduler, ALL, Effect::HotSwapOrUnload),
    (Field::Vae, ALL, Effect::Decoder),
    (Field::Seed, NONE, Effect::Reseed),
    (Field::BuildAccelerated, ALL, Effect::AcceleratedPath),
    (Field::AcceleratedEnabled, ALL, Effect::AcceleratedPath),
    (Field::PipelineSwitch, NONE, Effect::Stored),
    (Field::RefinerDefaults, NONE, Effect::Stored),
];

fn rule_for(field: Field) -> (&'static [Variant], Effect) {
    RULES
        .iter()
        .find(|(f, _, _)| *f == field)
        .map(|(_, variants, effect)| (*variants, *effect))
        .unwrap_or((NONE, Effect::Stored))
}

/// Outcome of a configuration update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppliedChanges {
    pub changed: Vec<Field>,
    pub unloaded: Vec<Variant>,
    pub hot_swapped: Vec<Variant>,
}

impl AppliedChanges {
    fn note_unloaded(&mut self, variant: Variant) {
        if !self.unloaded.contains(&variant) {
            self.unloaded.push(variant);
        }
    }

    fn note_hot_swapped(&mut self, variant: Variant) {
        if !self.hot_swapped.contains(&variant) {
            self.hot_swapped.push(variant);
        }
    }
}

/// Inputs that decide whether a variant's pipeline is still valid.
#[derive(Debug, Clone, PartialEq)]
struct Facts {
    source: Option<String>,
    size: u32,
    accelerated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantStatus {
    pub variant: Variant,
    pub model: Option<String>,
    pub state: PipelineState,
    pub constructions: u64,
    pub size: u32,
    pub accelerated: bool,
    pub accelerated_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub device: Device,
    pub precision: Precision,
    pub accelerated_enabled: bool,
    pub variants: Vec<VariantStatus>,
}

fn assign<T: PartialEq>(target: &mut T, value: Option<T>, field: Field, changed: &mut Vec<Field>) {
    if let Some(value) = value {
        if *target != value {
            *target = value;
            changed.push(field);
        }
    }
}

/// `<stem>-inpainting.<ext>` beside the base checkpoint, or the model itself if it already is one.
pub fn inpainting_fallback(model: &str) -> String {
    let path = Path::new(model);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| model.to_string());
    if stem.ends_with("inpainting") {
        return model.to_string();
    }
    let file = match path.extension() {
        Some(ext) => format!("{stem}-inpainting.{}", ext.to_string_lossy()),
        None => format!("{stem}-inpainting"),
    };
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(file).to_string_lossy().to_string(),
        _ => file,
    }
}

pub struct PipelineManager<B: PipelineBackend> {
    pub(super) backend: B,
    pub(super) config: EngineConfig,
    pub(super) layout: CacheLayout,
    pub(super) slots: [Lazy<PipelineInstance<B::Pipeline>>; 3],
    pub(super) constructions: [u64; 3],
    pub(super) generator: Lazy<Generator>,
    pub(super) accelerated_enabled: bool,
    pub(super) heartbeat: Heartbeat,
    next_serial: u64,
}

impl<B: PipelineBackend> PipelineManager<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let layout = CacheLayout::new(config.paths().cache);
        let heartbeat = Heartbeat::new(config.keepalive);
        Self {
            backend,
            config,
            layout,
            slots: [Lazy::Absent, Lazy::Absent, Lazy::Absent],
            constructions: [0; 3],
            generator: Lazy::Absent,
            accelerated_enabled: true,
            heartbeat,
            next_serial: 1,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn accelerated_enabled(&self) -> bool {
        self.accelerated_enabled
    }

    /// Callback fired by the heartbeat during long blocking steps.
    pub fn set_keepalive_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.heartbeat.slot().set(callback);
    }

    pub fn device(&self) -> Device {
        self.config.device.unwrap_or_default()
    }

    pub fn precision(&self) -> Precision {
        self.config
            .precision
            .unwrap_or_else(|| Precision::default_for(self.device()))
    }

    fn engine_kind(&self) -> EngineKind {
        EngineKind::for_device(self.device())
    }

    /// Weight source for a variant. The inpainter falls back to one derived from the base model.
    pub fn source(&self, variant: Variant) -> Option<String> {
        match variant {
            Variant::Base => self.config.model.clone(),
            Variant::Refiner => self.config.refiner.clone(),
            Variant::Inpainter => self
                .config
                .inpainter
                .clone()
                .or_else(|| self.config.model.as_deref().map(inpainting_fallback)),
        }
    }

    fn model_path(&self, source: &str) -> PathBuf {
        EnginePaths::resolve(&self.config.paths().checkpoint, source)
    }

    pub fn is_xl(&self, variant: Variant) -> bool {
        self.source(variant).is_some_and(|s| self.layout.is_xl(&s))
    }

    /// Engine size. Refiner and inpainter default to the family size when it differs from the base's.
    pub fn size(&self, variant: Variant) -> u32 {
        let explicit = match variant {
            Variant::Base => return self.config.size,
            Variant::Refiner => self.config.refiner_size,
            Variant::Inpainter => self.config.inpainter_size,
        };
        if let Some(size) = explicit {
            return size;
        }
        let variant_xl = self.is_xl(variant);
        if self.source(variant).is_some() && variant_xl != self.is_xl(Variant::Base) {
            if variant_xl {
                DEFAULT_XL_SIZE
            } else {
                DEFAULT_SIZE
            }
        } else {
            self.config.size
        }
    }

    /// Stages compiled for this variant. A base with ControlNet compiles the controlled denoiser.
    pub fn required_stages(&self, variant: Variant) -> Vec<Stage> {
        let controlled = variant == Variant::Base && self.config.controlnet.is_some();
        let mut stages = Vec::new();
        for stage in &self.config.accelerated_stages {
            let stage = match stage {
                Stage::Denoiser if controlled => Stage::ControlledDenoiser,
                Stage::ControlledDenoiser if !controlled => continue,
                other => *other,
            };
            if !stages.contains(&stage) {
                stages.push(stage);
            }
        }
        stages
    }

    pub fn stage_key(&self, variant: Variant, stage: Stage) -> CacheKey {
        CacheKey::for_stage(stage, self.size(variant), &self.config.weights)
    }

    pub fn accelerated_supported(&self, variant: Variant) -> bool {
        self.backend.supports_accelerated_engine() && !self.is_xl(variant)
    }

    /// Every required stage has a compiled plan on disk.
    pub fn accelerated_ready(&self, variant: Variant) -> bool {
        let Some(source) = self.source(variant) else {
            return false;
        };
        self.accelerated_supported(variant)
            && self.required_stages(variant).iter().all(|stage| {
                self.layout
                    .stage_ready(self.engine_kind(), &source, *stage, &self.stage_key(variant, *stage))
            })
    }

    pub fn use_accelerated(&self, variant: Variant) -> bool {
        self.accelerated_enabled
            && self.accelerated_supported(variant)
            && (self.accelerated_ready(variant) || self.config.build_accelerated)
    }

    fn always_cache(&self, variant: Variant) -> bool {
        self.config.always_cache.unwrap_or_else(|| self.is_xl(variant))
    }

    fn facts(&self, variant: Variant) -> Facts {
        Facts {
            source: self.source(variant),
            size: self.size(variant),
            accelerated: self.use_accelerated(variant),
        }
    }

    pub fn state(&self, variant: Variant) -> PipelineState {
        let slot = &self.slots[variant.index()];
        match slot.state() {
            LazyState::Absent => PipelineState::Unloaded,
            LazyState::Loading => PipelineState::Loading,
            LazyState::Present => match slot.get().map(|i| i.residency) {
                Some(Residency::OnHost) => PipelineState::Offloaded,
                _ => PipelineState::Loaded,
            },
        }
    }

    /// How many times this variant's pipeline has been constructed.
    pub fn constructions(&self, variant: Variant) -> u64 {
        self.constructions[variant.index()]
    }

    /// Identity of the loaded pipeline; changes on every construction.
    pub fn instance_serial(&self, variant: Variant) -> Option<u64> {
        self.slots[variant.index()].get().map(|i| i.serial)
    }

    pub fn is_accelerated(&self, variant: Variant) -> bool {
        self.slots[variant.index()].get().is_some_and(|i| i.accelerated)
    }

    /// Make the variant's pipeline loaded and on the device.
    pub fn ensure_ready(&mut self, variant: Variant) -> Result<()> {
        let wanted = self.use_accelerated(variant);
        if self.slots[variant.index()].get().is_some_and(|i| i.accelerated != wanted) {
            log_debug!(
                "manager",
                "{} pipeline accelerated={} but wanted {wanted}, rebuilding",
                variant.as_str(),
                !wanted
            );
            self.unload(variant);
        }

        if !self.slots[variant.index()].is_present() {
            self.slots[variant.index()].begin_loading();
            match self.construct(variant, wanted) {
                Ok(instance) => {
                    self.slots[variant.index()].fill(instance);
                    self.constructions[variant.index()] += 1;
                }
                Err(e) => {
                    self.slots[variant.index()].abort();
                    return Err(e);
                }
            }
        }
        self.reload(variant)
    }

    fn construct(&mut self, variant: Variant, accelerated: bool) -> Result<PipelineInstance<B::Pipeline>> {
        let model = self.source(variant).ok_or_else(|| {
            EngineError::Configuration(format!("no {} model configured", variant.as_str()))
        })?;
        let model_path = self.model_path(&model);
        let is_xl = self.layout.is_xl(&model);
        let size = self.size(variant);
        let snapshot = self.layout.existing_snapshot(&model);

        if variant == Variant::Inpainter
            && self.config.inpainter.is_none()
            && snapshot.is_none()
            && !model_path.exists()
        {
            let base = self.config.model.as_deref().map(|m| self.model_path(m)).ok_or_else(|| {
                EngineError::Configuration("no model to derive an inpainter from".to_string())
            })?;
            log_info!("manager", "Creating inpainting checkpoint {}", model_path.display());
            self.backend.create_inpainting_checkpoint(&base, &model_path)?;
        }

        let mut engines = Vec::new();
        let source = if accelerated {
            let snapshot = match snapshot {
                Some(dir) => dir,
                None => self.materialize_snapshot(variant, &model, &model_path, is_xl)?,
            };
            let kind = self.engine_kind();
            let mut dirs = Vec::new();
            for stage in self.required_stages(variant) {
                let key = self.stage_key(variant, stage);
                let dir = self.layout.stage_dir(kind, &model, stage, &key);
                let metadata = StageMetadata::for_stage(stage, size, &self.config.weights, self.config.controlnet);
                self.layout.ensure_stage_dir(&dir, &metadata)?;
                dirs.push((stage, dir));
                engines.push((stage, key));
            }
            ConstructionSource::Accelerated { snapshot, engines: dirs }
        } else if let Some(snapshot) = snapshot {
            ConstructionSource::Pretrained { snapshot }
        } else {
            ConstructionSource::Checkpoint { path: model_path }
        };

        log_info!(
            "manager",
            "Constructing {} pipeline from {model} ({})",
            variant.as_str(),
            match &source {
                ConstructionSource::Accelerated { .. } => "accelerated",
                ConstructionSource::Pretrained { .. } => "pretrained",
                ConstructionSource::Checkpoint { .. } => "checkpoint",
            }
        );
        let spec = self.construction_spec(variant, &model, source, is_xl);
        let mut pipeline = self.backend.construct(&spec)?;

        if matches!(spec.source, ConstructionSource::Checkpoint { .. }) && self.always_cache(variant) {
            let dir = self.layout.snapshot_dir(&model);
            log_debug!("manager", "Caching converted snapshot at {}", dir.display());
            pipeline.save_pretrained(&dir)?;
        }

        if !accelerated {
            self.apply_auxiliary_weights(&mut pipeline)?;
        }
        if let Some(scheduler) = self.config.scheduler {
            pipeline.set_scheduler(scheduler)?;
        }
        if let Some(scheduler) = self.config.multi_scheduler {
            pipeline.set_multi_scheduler(scheduler)?;
        }
        let decoder_compiled = engines.iter().any(|(s, _)| *s == Stage::Decoder);
        if let Some(vae) = self.config.vae {
            if decoder_compiled {
                log_debug!("manager", "Decoder is compiled, ignoring vae {vae:?}");
            } else if vae.compatible_with(is_xl) {
                pipeline.set_vae(vae)?;
            } else {
                log_warn!("manager", "Skipping vae {vae:?} for {} pipeline", variant.as_str());
            }
        }
        pipeline.to(Placement::Device(self.device()), self.precision())?;

        let serial = self.next_serial;
        self.next_serial += 1;
        Ok(PipelineInstance {
            pipeline,
            residency: Residency::OnDevice,
            accelerated,
            engines,
            serial,
        })
    }

    fn construction_spec(&self, variant: Variant, model: &str, source: ConstructionSource, is_xl: bool) -> ConstructionSpec {
        ConstructionSpec {
            variant,
            model: model.to_string(),
            source,
            engine_size: self.size(variant),
            chunking_size: self.config.chunking_size,
            chunking_blur: self.config.chunking_blur,
            precision: self.precision(),
            safe: self.config.safe && variant != Variant::Refiner,
            is_xl,
            controlnet: if variant == Variant::Base { self.config.controlnet } else { None },
        }
    }

    /// Convert a checkpoint once so compiled engines have a snapshot to build from.
    fn materialize_snapshot(&mut self, variant: Variant, model: &str, model_path: &Path, is_xl: bool) -> Result<PathBuf> {
        let dir = self.layout.snapshot_dir(model);
        log_info!("manager", "Converting {model} to a snapshot for engine builds");
        let spec = self.construction_spec(
            variant,
            model,
            ConstructionSource::Checkpoint {
                path: model_path.to_path_buf(),
            },
            is_xl,
        );
        let converted = self.backend.construct(&spec)?;
        converted.save_pretrained(&dir)?;
        Ok(dir)
    }

    fn apply_auxiliary_weights(&self, pipeline: &mut B::Pipeline) -> Result<()> {
        let paths = self.config.paths();
        let weights = &self.config.weights;
        for lora in &weights.lora {
            pipeline.apply_auxiliary_weights(WeightKind::Lora, lora, &EnginePaths::resolve(&paths.lora, &lora.name))?;
        }
        for lycoris in &weights.lycoris {
            pipeline.apply_auxiliary_weights(
                WeightKind::Lycoris,
                lycoris,
                &EnginePaths::resolve(&paths.lycoris, &lycoris.name),
            )?;
        }
        for inversion in &weights.inversion {
            pipeline.apply_auxiliary_weights(
                WeightKind::Inversion,
                &AuxiliaryWeight::new(inversion.clone(), 1.0),
                &EnginePaths::resolve(&paths.inversion, inversion),
            )?;
        }
        Ok(())
    }

    /// Move a loaded pipeline to host memory.
    pub fn offload(&mut self, variant: Variant) -> Result<()> {
        let precision = self.precision();
        if let Some(instance) = self.slots[variant.index()].get_mut() {
            if instance.residency == Residency::OnDevice {
                log_debug!("manager", "Offloading {} pipeline", variant.as_str());
                instance.pipeline.to(Placement::Host, precision)?;
                instance.residency = Residency::OnHost;
            }
        }
        Ok(())
    }

    /// Bring an offloaded pipeline back to the device.
    pub fn reload(&mut self, variant: Variant) -> Result<()> {
        let device = self.device();
        let precision = self.precision();
        if let Some(instance) = self.slots[variant.index()].get_mut() {
            if instance.residency == Residency::OnHost {
                log_debug!("manager", "Reloading {} pipeline", variant.as_str());
                instance.pipeline.to(Placement::Device(device), precision)?;
                instance.residency = Residency::OnDevice;
            }
        }
        Ok(())
    }

    /// Destroy the variant's pipeline. Returns whether one was loaded.
    pub fn unload(&mut self, variant: Variant) -> bool {
        let dropped = self.slots[variant.index()].invalidate().is_some();
        if dropped {
            log_debug!("manager", "Unloaded {} pipeline", variant.as_str());
        }
        dropped
    }

    pub fn unload_all(&mut self) -> Vec<Variant> {
        Variant::ALL.into_iter().filter(|v| self.unload(*v)).collect()
    }

    /// Free the variant according to the swap policy.
    pub fn release(&mut self, variant: Variant, policy: SwapPolicy) -> Result<()> {
        match policy {
            SwapPolicy::Offload => self.offload(variant),
            SwapPolicy::Unload => {
                self.unload(variant);
                Ok(())
            }
            SwapPolicy::Keep => Ok(()),
        }
    }

    /// Apply a partial configuration change, patching or dropping loaded pipelines.
    ///
    /// The update is validated as a whole first; nothing changes if it is rejected.
    pub fn apply_configuration(&mut self, update: ConfigurationUpdate) -> Result<AppliedChanges> {
        let mut candidate = self.config.clone();
        let mut enabled = self.accelerated_enabled;
        let mut changed = Vec::new();

        assign(&mut candidate.model, update.model.map(Some), Field::Model, &mut changed);
        assign(&mut candidate.refiner, update.refiner, Field::Refiner, &mut changed);
        assign(&mut candidate.inpainter, update.inpainter, Field::Inpainter, &mut changed);
        assign(&mut candidate.size, update.size, Field::Size, &mut changed);
        assign(&mut candidate.refiner_size, update.refiner_size, Field::RefinerSize, &mut changed);
        assign(&mut candidate.inpainter_size, update.inpainter_size, Field::InpainterSize, &mut changed);
        assign(&mut candidate.chunking_size, update.chunking_size, Field::ChunkingSize, &mut changed);
        assign(&mut candidate.chunking_blur, update.chunking_blur, Field::ChunkingBlur, &mut changed);
        assign(&mut candidate.weights.lora, update.lora, Field::Lora, &mut changed);
        assign(&mut candidate.weights.lycoris, update.lycoris, Field::Lycoris, &mut changed);
        assign(&mut candidate.weights.inversion, update.inversion, Field::Inversion, &mut changed);
        assign(&mut candidate.precision, update.precision, Field::Precision, &mut changed);
        assign(&mut candidate.device, update.device, Field::Device, &mut changed);
        assign(&mut candidate.safe, update.safe, Field::Safe, &mut changed);
        assign(&mut candidate.scheduler, update.scheduler, Field::Scheduler, &mut changed);
        assign(&mut candidate.multi_scheduler, update.multi_scheduler, Field::MultiScheduler, &mut changed);
        assign(&mut candidate.vae, update.vae, Field::Vae, &mut changed);
        assign(&mut candidate.controlnet, update.controlnet, Field::Controlnet, &mut changed);
        assign(&mut candidate.seed, update.seed, Field::Seed, &mut changed);
        assign(&mut candidate.build_accelerated, update.build_accelerated, Field::BuildAccelerated, &mut changed);
        assign(&mut enabled, update.accelerated_enabled, Field::AcceleratedEnabled, &mut changed);
        assign(&mut candidate.pipeline_switch, update.pipeline_switch, Field::PipelineSwitch, &mut changed);
        assign(&mut candidate.refiner_defaults, update.refiner_defaults, Field::RefinerDefaults, &mut changed);

        candidate.validate()?;
        let mut applied = AppliedChanges::default();
        if changed.is_empty() {
            return Ok(applied);
        }

        let before: Vec<Facts> = Variant::ALL.iter().map(|v| self.facts(*v)).collect();
        self.config = candidate;
        self.accelerated_enabled = enabled;
        let after: Vec<Facts> = Variant::ALL.iter().map(|v| self.facts(*v)).collect();

        for field in &changed {
            let (variants, effect) = match rule_for(*field) {
                (variants, Effect::HotSwapOrUnload) if self.scheduler_cleared(*field) => (variants, Effect::Unload),
                rule => rule,
            };
            if effect == Effect::Reseed {
                self.generator.invalidate();
                continue;
            }
            for variant in variants {
                let i = variant.index();
                if !self.slots[i].is_present() {
                    continue;
                }
                if let Err(e) = self.apply_effect(*variant, effect, &before[i], &after[i], &mut applied) {
                    log_warn!("manager", "Could not update {} pipeline in place ({e}), unloading", variant.as_str());
                    self.unload(*variant);
                    applied.note_unloaded(*variant);
                }
            }
        }
        applied.changed = changed;
        log_info!(
            "manager",
            "Configuration changed {:?}; unloaded {:?}, updated {:?}",
            applied.changed,
            applied.unloaded,
            applied.hot_swapped
        );
        Ok(applied)
    }

    /// A scheduler field that was set and is now cleared.
    fn scheduler_cleared(&self, field: Field) -> bool {
        match field {
            Field::Scheduler => self.config.scheduler.is_none(),
            Field::MultiScheduler => self.config.multi_scheduler.is_none(),
            _ => false,
        }
    }

    fn apply_effect(
        &mut self,
        variant: Variant,
        effect: Effect,
        before: &Facts,
        after: &Facts,
        applied: &mut AppliedChanges,
    ) -> Result<()> {
        let config = &self.config;
        let is_xl = after.source.as_deref().is_some_and(|s| self.layout.is_xl(s));
        let Some(instance) = self.slots[variant.index()].get_mut() else {
            return Ok(());
        };

        let unload = match effect {
            Effect::Unload => true,
            Effect::SourceChanged => before.source != after.source,
            Effect::AcceleratedPath => before.accelerated != after.accelerated,
            Effect::Resize => {
                if before.size == after.size {
                    false
                } else if instance.accelerated {
                    true
                } else {
                    instance.pipeline.set_engine_size(after.size)?;
                    applied.note_hot_swapped(variant);
                    false
                }
            }
            Effect::HotSwap => {
                instance.pipeline.set_chunking(config.chunking_size, config.chunking_blur);
                applied.note_hot_swapped(variant);
                false
            }
            Effect::HotSwapOrUnload => {
                if let Some(s) = config.scheduler {
                    instance.pipeline.set_scheduler(s)?;
                }
                if let Some(s) = config.multi_scheduler {
                    instance.pipeline.set_multi_scheduler(s)?;
                }
                applied.note_hot_swapped(variant);
                false
            }
            Effect::Decoder => match config.vae {
                _ if instance.compiles(Stage::Decoder) => false,
                Some(vae) if vae.compatible_with(is_xl) => {
                    instance.pipeline.set_vae(vae)?;
                    applied.note_hot_swapped(variant);
                    false
                }
                Some(_) => false,
                None => true,
            },
            Effect::Reseed | Effect::Stored => false,
        };

        if unload {
            self.unload(variant);
            applied.note_unloaded(variant);
        }
        Ok(())
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            device: self.device(),
            precision: self.precision(),
            accelerated_enabled: self.accelerated_enabled,
            variants: Variant::ALL
                .iter()
                .map(|v| VariantStatus {
                    variant: *v,
                    model: self.source(*v),
                    state: self.state(*v),
                    constructions: self.constructions(*v),
                    size: self.size(*v),
                    accelerated: self.is_accelerated(*v),
                    accelerated_ready: self.accelerated_ready(*v),
                })
                .collect(),
        }
    }

    pub fn engine_status(&self, query: &EngineStatusQuery) -> EngineStatus {
        status::probe(
            &self.layout,
            self.engine_kind(),
            self.backend.supports_accelerated_engine(),
            &self.config.accelerated_stages,
            self.config.size,
            query,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::dry_run::{DryRunBackend, DryRunHandle, DryRunState, SourceKind};
    use crate::pipeline::layout::test_support::TempRoot;
    use crate::pipeline::settings::Scheduler;
    use serde_json::json;

    pub(crate) fn manager_with(
        root: &TempRoot,
        state: DryRunState,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> (PipelineManager<DryRunBackend>, DryRunHandle) {
        let mut config = EngineConfig {
            root: root.0.clone(),
            model: Some("sd15.ckpt".to_string()),
            ..EngineConfig::default()
        };
        configure(&mut config);
        let backend = DryRunBackend::new(state);
        let handle = backend.handle();
        (PipelineManager::new(backend, config), handle)
    }

    fn update(value: serde_json::Value) -> ConfigurationUpdate {
        ConfigurationUpdate::from_value(value).unwrap()
    }

    #[test]
    fn test_lazy_construction_happens_once() {
        let root = TempRoot::new("manager_once");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |_| {});
        assert_eq!(manager.state(Variant::Base), PipelineState::Unloaded);

        manager.ensure_ready(Variant::Base).unwrap();
        manager.ensure_ready(Variant::Base).unwrap();
        assert_eq!(manager.constructions(Variant::Base), 1);
        assert_eq!(manager.state(Variant::Base), PipelineState::Loaded);
        assert_eq!(handle.lock().constructions[0].source, SourceKind::Checkpoint);
    }

    #[test]
    fn test_missing_model_is_configuration_error() {
        let root = TempRoot::new("manager_missing");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |_| {});
        let err = manager.ensure_ready(Variant::Refiner).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert_eq!(manager.state(Variant::Refiner), PipelineState::Unloaded);
    }

    #[test]
    fn test_weight_strength_change_forces_reconstruction() {
        let root = TempRoot::new("manager_lora");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |c| {
            c.weights.lora = vec![AuxiliaryWeight::new("style", 0.5)];
        });
        manager.ensure_ready(Variant::Base).unwrap();
        let serial = manager.instance_serial(Variant::Base);

        let applied = manager
            .apply_configuration(update(json!({"lora": [["style", 0.8]]})))
            .unwrap();
        assert_eq!(applied.changed, vec![Field::Lora]);
        assert_eq!(applied.unloaded, vec![Variant::Base]);
        assert_eq!(manager.state(Variant::Base), PipelineState::Unloaded);

        manager.ensure_ready(Variant::Base).unwrap();
        assert_eq!(manager.constructions(Variant::Base), 2);
        assert_ne!(manager.instance_serial(Variant::Base), serial);
        assert_eq!(handle.lock().weights.len(), 2);
    }

    #[test]
    fn test_chunking_change_keeps_instance() {
        let root = TempRoot::new("manager_chunk");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |_| {});
        manager.ensure_ready(Variant::Base).unwrap();
        let serial = manager.instance_serial(Variant::Base);

        let applied = manager
            .apply_configuration(update(json!({"chunking_size": 32})))
            .unwrap();
        assert!(applied.unloaded.is_empty());
        assert_eq!(applied.hot_swapped, vec![Variant::Base]);
        assert_eq!(manager.instance_serial(Variant::Base), serial);
        assert_eq!(manager.constructions(Variant::Base), 1);
        assert_eq!(handle.lock().chunking, vec![(Variant::Base, 32, 64)]);
    }

    #[test]
    fn test_unchanged_value_is_noop() {
        let root = TempRoot::new("manager_noop");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |_| {});
        manager.ensure_ready(Variant::Base).unwrap();
        let applied = manager
            .apply_configuration(update(json!({"model": "sd15.ckpt", "size": 512})))
            .unwrap();
        assert_eq!(applied, AppliedChanges::default());
        assert_eq!(manager.state(Variant::Base), PipelineState::Loaded);
    }

    #[test]
    fn test_invalid_update_changes_nothing() {
        let root = TempRoot::new("manager_invalid");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |_| {});
        manager.ensure_ready(Variant::Base).unwrap();
        let err = manager
            .apply_configuration(update(json!({"size": 500, "lora": ["style"]})))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(manager.config().weights.lora.is_empty());
        assert_eq!(manager.state(Variant::Base), PipelineState::Loaded);
    }

    #[test]
    fn test_scheduler_hot_swap_and_clear() {
        let root = TempRoot::new("manager_scheduler");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |_| {});
        manager.ensure_ready(Variant::Base).unwrap();

        let applied = manager
            .apply_configuration(update(json!({"scheduler": "unipc"})))
            .unwrap();
        assert_eq!(applied.hot_swapped, vec![Variant::Base]);
        assert_eq!(handle.lock().schedulers, vec![(Variant::Base, Scheduler::Unipc)]);

        let applied = manager
            .apply_configuration(update(json!({"scheduler": null})))
            .unwrap();
        assert_eq!(applied.unloaded, vec![Variant::Base]);
    }

    #[test]
    fn test_offload_then_reload_without_reconstruction() {
        let root = TempRoot::new("manager_offload");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |_| {});
        manager.ensure_ready(Variant::Base).unwrap();

        manager.release(Variant::Base, SwapPolicy::Offload).unwrap();
        assert_eq!(manager.state(Variant::Base), PipelineState::Offloaded);

        manager.ensure_ready(Variant::Base).unwrap();
        assert_eq!(manager.state(Variant::Base), PipelineState::Loaded);
        assert_eq!(manager.constructions(Variant::Base), 1);
        assert_eq!(
            handle.lock().placements,
            vec![
                (Variant::Base, Placement::Device(Device::Cpu)),
                (Variant::Base, Placement::Host),
                (Variant::Base, Placement::Device(Device::Cpu)),
            ]
        );

        manager.release(Variant::Base, SwapPolicy::Keep).unwrap();
        assert_eq!(manager.state(Variant::Base), PipelineState::Loaded);
        manager.release(Variant::Base, SwapPolicy::Unload).unwrap();
        assert_eq!(manager.state(Variant::Base), PipelineState::Unloaded);
    }

    #[test]
    fn test_always_cache_writes_snapshot_then_uses_it() {
        let root = TempRoot::new("manager_cache");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |c| c.always_cache = Some(true));
        manager.ensure_ready(Variant::Base).unwrap();
        assert!(manager.layout().existing_snapshot("sd15.ckpt").is_some());

        manager.unload(Variant::Base);
        manager.ensure_ready(Variant::Base).unwrap();
        let sources: Vec<SourceKind> = handle.lock().constructions.iter().map(|c| c.source).collect();
        assert_eq!(sources, vec![SourceKind::Checkpoint, SourceKind::Pretrained]);
    }

    #[test]
    fn test_accelerated_build_writes_metadata_and_skips_weights() {
        let root = TempRoot::new("manager_accel");
        let state = DryRunState {
            accelerated_supported: true,
            ..DryRunState::default()
        };
        let (mut manager, handle) = manager_with(&root, state, |c| {
            c.build_accelerated = true;
            c.weights.lora = vec![AuxiliaryWeight::new("style", 0.5)];
        });
        assert!(!manager.accelerated_ready(Variant::Base));
        manager.ensure_ready(Variant::Base).unwrap();

        assert!(manager.is_accelerated(Variant::Base));
        assert!(manager.accelerated_ready(Variant::Base));
        assert!(handle.lock().weights.is_empty());

        let key = manager.stage_key(Variant::Base, Stage::Denoiser);
        let dir = manager
            .layout()
            .stage_dir(EngineKind::TensorRt, "sd15.ckpt", Stage::Denoiser, &key);
        let metadata = CacheLayout::read_metadata(&dir).unwrap();
        assert_eq!(metadata.size, 512);
        assert_eq!(metadata.lora, Some(vec![("style".to_string(), 0.5)]));

        // Snapshot conversion, then the accelerated build
        let sources: Vec<SourceKind> = handle.lock().constructions.iter().map(|c| c.source).collect();
        assert_eq!(sources, vec![SourceKind::Checkpoint, SourceKind::Accelerated]);

        let applied = manager
            .apply_configuration(update(json!({"accelerated_enabled": false})))
            .unwrap();
        assert_eq!(applied.unloaded, vec![Variant::Base]);
    }

    #[test]
    fn test_resize_hot_swaps_plain_pipelines() {
        let root = TempRoot::new("manager_resize");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |_| {});
        manager.ensure_ready(Variant::Base).unwrap();
        let applied = manager.apply_configuration(update(json!({"size": 768}))).unwrap();
        assert!(applied.unloaded.is_empty());
        assert_eq!(applied.hot_swapped, vec![Variant::Base]);
    }

    #[test]
    fn test_variant_sizes_follow_model_family() {
        let root = TempRoot::new("manager_sizes");
        let (manager, _) = manager_with(&root, DryRunState::default(), |c| {
            c.refiner = Some("sd_xl_refiner_1.0.safetensors".to_string());
        });
        assert_eq!(manager.size(Variant::Base), 512);
        assert_eq!(manager.size(Variant::Refiner), 1024);
        assert_eq!(manager.size(Variant::Inpainter), 512);
    }

    #[test]
    fn test_inpainter_fallback() {
        assert_eq!(inpainting_fallback("sd15.ckpt"), "sd15-inpainting.ckpt");
        assert_eq!(inpainting_fallback("/m/sd15.safetensors"), "/m/sd15-inpainting.safetensors");
        assert_eq!(inpainting_fallback("sd15-inpainting.ckpt"), "sd15-inpainting.ckpt");

        let root = TempRoot::new("manager_inpaint");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |_| {});
        assert_eq!(manager.source(Variant::Inpainter).as_deref(), Some("sd15-inpainting.ckpt"));
        manager.ensure_ready(Variant::Inpainter).unwrap();
        assert!(root.0.join("checkpoint").join("sd15-inpainting.ckpt").exists());
    }

    #[test]
    fn test_model_change_unloads_base_and_derived_inpainter() {
        let root = TempRoot::new("manager_model");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |c| {
            c.refiner = Some("refiner.ckpt".to_string());
        });
        for variant in Variant::ALL {
            manager.ensure_ready(variant).unwrap();
        }
        let applied = manager
            .apply_configuration(update(json!({"model": "dreamshaper.ckpt"})))
            .unwrap();
        assert_eq!(applied.unloaded, vec![Variant::Base, Variant::Inpainter]);
        assert_eq!(manager.state(Variant::Refiner), PipelineState::Loaded);
    }

    #[test]
    fn test_reseed_discards_generator() {
        let root = TempRoot::new("manager_seed");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |c| c.seed = Some(1));
        manager.generator.fill(Generator::new(1));
        manager.apply_configuration(update(json!({"seed": 2}))).unwrap();
        assert!(!manager.generator.is_present());
    }

    #[test]
    fn test_status_reports_each_variant() {
        let root = TempRoot::new("manager_status");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |_| {});
        manager.ensure_ready(Variant::Base).unwrap();
        let status = manager.status();
        assert_eq!(status.precision, Precision::BFloat);
        assert_eq!(status.variants.len(), 3);
        assert_eq!(status.variants[0].state, PipelineState::Loaded);
        assert_eq!(status.variants[0].constructions, 1);
        assert_eq!(status.variants[1].model, None);
    }
}
