//! Static readiness probe for compiled engines.
//!
//! Answers "would this model run accelerated right now" from the cache
//! layout alone, without constructing anything.

use serde::{Deserialize, Serialize};

use super::cache_key::CacheKey;
use super::layout::{CacheLayout, EngineKind};
use super::settings::{AuxiliaryWeights, Controlnet};
use super::variant::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatusQuery {
    pub model: String,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(flatten)]
    pub weights: AuxiliaryWeights,
    #[serde(default)]
    pub controlnet: Option<Controlnet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub supported: bool,
    pub xl: bool,
    pub unet_ready: bool,
    pub controlled_unet_ready: bool,
    pub vae_ready: bool,
    pub clip_ready: bool,
    pub ready: bool,
}

/// Stages not compiled count as ready. XL models are never supported.
pub fn probe(
    layout: &CacheLayout,
    kind: EngineKind,
    backend_supported: bool,
    accelerated_stages: &[Stage],
    default_size: u32,
    query: &EngineStatusQuery,
) -> EngineStatus {
    let xl = layout.is_xl(&query.model);
    let supported = backend_supported && !xl;
    let size = query.size.unwrap_or(default_size);

    let stage_ready = |stage: Stage| {
        if !accelerated_stages.contains(&stage) {
            return true;
        }
        let key = CacheKey::for_stage(stage, size, &query.weights);
        layout.stage_ready(kind, &query.model, stage, &key)
    };

    let clip_ready = stage_ready(Stage::TextEncoder);
    let vae_ready = stage_ready(Stage::Decoder);
    let unet_ready = stage_ready(Stage::Denoiser);
    // The controlled denoiser replaces the plain one whenever the denoiser is compiled
    let controlled_unet_ready = !accelerated_stages.contains(&Stage::Denoiser) || {
        let key = CacheKey::for_stage(Stage::ControlledDenoiser, size, &query.weights);
        layout.stage_ready(kind, &query.model, Stage::ControlledDenoiser, &key)
    };

    let denoiser_ready = if query.controlnet.is_some() {
        controlled_unet_ready
    } else {
        unet_ready
    };

    EngineStatus {
        supported,
        xl,
        unet_ready,
        controlled_unet_ready,
        vae_ready,
        clip_ready,
        ready: supported && clip_ready && vae_ready && denoiser_ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::layout::test_support::TempRoot;
    use crate::pipeline::settings::AuxiliaryWeight;

    fn query(model: &str) -> EngineStatusQuery {
        EngineStatusQuery {
            model: model.to_string(),
            size: None,
            weights: AuxiliaryWeights::default(),
            controlnet: None,
        }
    }

    fn compile(layout: &CacheLayout, model: &str, stage: Stage, size: u32, weights: &AuxiliaryWeights) {
        let key = CacheKey::for_stage(stage, size, weights);
        let dir = layout.stage_dir(EngineKind::TensorRt, model, stage, &key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(CacheLayout::engine_plan(&dir), b"plan").unwrap();
    }

    #[test]
    fn test_unet_only_readiness() {
        let root = TempRoot::new("status");
        let layout = CacheLayout::new(&root.0);
        let stages = [Stage::Denoiser];

        let status = probe(&layout, EngineKind::TensorRt, true, &stages, 512, &query("sd15.ckpt"));
        assert!(status.supported);
        assert!(!status.unet_ready);
        assert!(status.clip_ready && status.vae_ready);
        assert!(!status.ready);

        compile(&layout, "sd15.ckpt", Stage::Denoiser, 512, &AuxiliaryWeights::default());
        let status = probe(&layout, EngineKind::TensorRt, true, &stages, 512, &query("sd15.ckpt"));
        assert!(status.unet_ready);
        assert!(status.ready);

        let mut with_controlnet = query("sd15.ckpt");
        with_controlnet.controlnet = Some(Controlnet::Canny);
        let status = probe(&layout, EngineKind::TensorRt, true, &stages, 512, &with_controlnet);
        assert!(!status.controlled_unet_ready);
        assert!(!status.ready);
    }

    #[test]
    fn test_weights_and_size_select_the_engine() {
        let root = TempRoot::new("status_weights");
        let layout = CacheLayout::new(&root.0);
        let weights = AuxiliaryWeights {
            lora: vec![AuxiliaryWeight::new("style", 0.5)],
            ..AuxiliaryWeights::default()
        };
        compile(&layout, "sd15.ckpt", Stage::Denoiser, 768, &weights);

        let mut q = query("sd15.ckpt");
        q.size = Some(768);
        assert!(!probe(&layout, EngineKind::TensorRt, true, &[Stage::Denoiser], 512, &q).ready);
        q.weights = weights;
        assert!(probe(&layout, EngineKind::TensorRt, true, &[Stage::Denoiser], 512, &q).ready);
    }

    #[test]
    fn test_xl_is_unsupported() {
        let root = TempRoot::new("status_xl");
        let layout = CacheLayout::new(&root.0);
        let status = probe(&layout, EngineKind::TensorRt, true, &[Stage::Denoiser], 1024, &query("sd_xl_base.safetensors"));
        assert!(status.xl);
        assert!(!status.supported);
        assert!(!status.ready);
    }

    #[test]
    fn test_query_accepts_flattened_weights() {
        let q: EngineStatusQuery =
            serde_json::from_value(serde_json::json!({"model": "sd15.ckpt", "lora": [["style", 0.5]]})).unwrap();
        assert_eq!(q.weights.lora.len(), 1);
        assert_eq!(q.size, None);
    }
}
