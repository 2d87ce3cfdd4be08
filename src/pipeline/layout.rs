//! On-disk layout of converted snapshots and compiled engine stages.
//!
//! ```text
//! <root>/diffusers/<model>/model_index.json
//! <root>/<tensorrt|onnx>/<model>/<stage>/<cache-key>/engine.plan
//! <root>/<tensorrt|onnx>/<model>/<stage>/<cache-key>/metadata.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::cache_key::CacheKey;
use super::settings::{AuxiliaryWeight, AuxiliaryWeights, Controlnet, Device};
use super::variant::Stage;
use crate::error::Result;
use crate::log_debug;

const SNAPSHOT_DIR: &str = "diffusers";
const MODEL_INDEX: &str = "model_index.json";
const ENGINE_PLAN: &str = "engine.plan";
const METADATA: &str = "metadata.json";

/// Checkpoint file extensions stripped from model names.
const CHECKPOINT_EXTENSIONS: [&str; 2] = ["ckpt", "safetensors"];

/// Compiled engine family. DirectML devices use ONNX engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    TensorRt,
    Onnx,
}

impl EngineKind {
    pub fn for_device(device: Device) -> Self {
        match device {
            Device::Dml => EngineKind::Onnx,
            _ => EngineKind::TensorRt,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            EngineKind::TensorRt => "tensorrt",
            EngineKind::Onnx => "onnx",
        }
    }
}

/// Contents of a stage's `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetadata {
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<Vec<(String, f32)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lycoris: Option<Vec<(String, f32)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inversion: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlnet: Option<String>,
}

impl StageMetadata {
    pub fn for_stage(
        stage: Stage,
        size: u32,
        weights: &AuxiliaryWeights,
        controlnet: Option<Controlnet>,
    ) -> Self {
        let pairs = |list: &[AuxiliaryWeight]| {
            list.iter().map(|w| (w.key_name(), w.weight)).collect::<Vec<_>>()
        };
        // The controlled denoiser records its conditioning instead of the weight lists
        let carries = stage.carries_weights() && !matches!(stage, Stage::ControlledDenoiser);
        StageMetadata {
            size,
            lora: carries.then(|| pairs(&weights.lora)),
            lycoris: carries.then(|| pairs(&weights.lycoris)),
            inversion: carries.then(|| weights.inversion.clone()),
            controlnet: match stage {
                Stage::ControlledDenoiser => controlnet.map(|c| c.as_str().to_string()),
                _ => None,
            },
        }
    }
}

/// Model name used for cache directories: the checkpoint stem or the last path segment.
pub fn model_name(source: &str) -> String {
    let path = Path::new(source);
    let has_checkpoint_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| CHECKPOINT_EXTENSIONS.contains(&e.to_lowercase().as_str()));
    let name = if has_checkpoint_ext {
        path.file_stem()
    } else {
        path.file_name()
    };
    name.map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source.to_string())
}

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn engine_dir(&self, kind: EngineKind, model: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(model_name(model))
    }

    pub fn stage_dir(&self, kind: EngineKind, model: &str, stage: Stage, key: &CacheKey) -> PathBuf {
        self.engine_dir(kind, model)
            .join(stage.dir_name())
            .join(key.as_str())
    }

    pub fn engine_plan(stage_dir: &Path) -> PathBuf {
        stage_dir.join(ENGINE_PLAN)
    }

    pub fn stage_ready(&self, kind: EngineKind, model: &str, stage: Stage, key: &CacheKey) -> bool {
        Self::engine_plan(&self.stage_dir(kind, model, stage, key)).exists()
    }

    pub fn snapshot_dir(&self, model: &str) -> PathBuf {
        self.root.join(SNAPSHOT_DIR).join(model_name(model))
    }

    /// The converted snapshot directory, if one has been materialized.
    pub fn existing_snapshot(&self, model: &str) -> Option<PathBuf> {
        let dir = self.snapshot_dir(model);
        dir.join(MODEL_INDEX).exists().then_some(dir)
    }

    /// XL detection: a second text encoder in any known snapshot, else the name.
    pub fn is_xl(&self, model: &str) -> bool {
        let candidates = [
            self.engine_dir(EngineKind::TensorRt, model),
            self.snapshot_dir(model),
        ];
        for dir in candidates {
            if dir.join(MODEL_INDEX).exists() {
                return dir.join("tokenizer_2").exists() || dir.join("text_encoder_2").exists();
            }
        }
        model_name(model).to_lowercase().contains("xl")
    }

    /// Create the stage directory and write its metadata if absent.
    ///
    /// Returns whether metadata was written by this call.
    pub fn ensure_stage_dir(&self, stage_dir: &Path, metadata: &StageMetadata) -> Result<bool> {
        fs::create_dir_all(stage_dir)?;
        let path = stage_dir.join(METADATA);
        if path.exists() {
            return Ok(false);
        }
        fs::write(&path, serde_json::to_vec_pretty(metadata)?)?;
        log_debug!("cache", "Wrote stage metadata {}", path.display());
        Ok(true)
    }

    pub fn read_metadata(stage_dir: &Path) -> Result<StageMetadata> {
        let bytes = fs::read(stage_dir.join(METADATA))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TempRoot;
    use super::*;

    #[test]
    fn test_model_name() {
        assert_eq!(model_name("/models/v1-5-pruned.ckpt"), "v1-5-pruned");
        assert_eq!(model_name("dreamshaper.safetensors"), "dreamshaper");
        assert_eq!(model_name("runwayml/stable-diffusion-v1-5"), "stable-diffusion-v1-5");
    }

    #[test]
    fn test_stage_dir_layout() {
        let layout = CacheLayout::new("/cache");
        let key = CacheKey::for_stage(Stage::Denoiser, 512, &AuxiliaryWeights::default());
        let dir = layout.stage_dir(EngineKind::TensorRt, "/m/sd15.ckpt", Stage::Denoiser, &key);
        assert_eq!(
            dir,
            PathBuf::from("/cache/tensorrt/sd15/unet").join(key.as_str())
        );
        assert_eq!(EngineKind::for_device(Device::Dml), EngineKind::Onnx);
    }

    #[test]
    fn test_metadata_written_once() {
        let root = TempRoot::new("layout");
        let layout = CacheLayout::new(&root.0);
        let weights = AuxiliaryWeights {
            lora: vec![AuxiliaryWeight::new("style.safetensors", 0.5)],
            ..AuxiliaryWeights::default()
        };
        let key = CacheKey::for_stage(Stage::TextEncoder, 512, &weights);
        let dir = layout.stage_dir(EngineKind::TensorRt, "sd15", Stage::TextEncoder, &key);

        let first = StageMetadata::for_stage(Stage::TextEncoder, 512, &weights, None);
        assert!(layout.ensure_stage_dir(&dir, &first).unwrap());

        let second = StageMetadata::for_stage(Stage::TextEncoder, 768, &weights, None);
        assert!(!layout.ensure_stage_dir(&dir, &second).unwrap());

        let stored = CacheLayout::read_metadata(&dir).unwrap();
        assert_eq!(stored.size, 512);
        assert_eq!(stored.lora, Some(vec![("style".to_string(), 0.5)]));
        assert!(!layout.stage_ready(EngineKind::TensorRt, "sd15", Stage::TextEncoder, &key));
    }

    #[test]
    fn test_metadata_per_stage_kind() {
        let weights = AuxiliaryWeights {
            lora: vec![AuxiliaryWeight::new("style.safetensors", 0.5)],
            inversion: vec!["ink".to_string()],
            ..AuxiliaryWeights::default()
        };
        let decoder = StageMetadata::for_stage(Stage::Decoder, 512, &weights, Some(Controlnet::Canny));
        assert!(decoder.lora.is_none());
        assert!(decoder.controlnet.is_none());

        let controlled =
            StageMetadata::for_stage(Stage::ControlledDenoiser, 512, &weights, Some(Controlnet::Canny));
        assert_eq!(controlled.controlnet.as_deref(), Some("canny"));
        assert!(controlled.lora.is_none());
        assert!(controlled.lycoris.is_none());
        assert!(controlled.inversion.is_none());

        let denoiser = StageMetadata::for_stage(Stage::Denoiser, 512, &weights, Some(Controlnet::Canny));
        assert_eq!(denoiser.lora, Some(vec![("style".to_string(), 0.5)]));
        assert!(denoiser.controlnet.is_none());
    }

    #[test]
    fn test_is_xl_from_snapshot_or_name() {
        let root = TempRoot::new("xl");
        let layout = CacheLayout::new(&root.0);
        assert!(layout.is_xl("sd_xl_base_1.0.safetensors"));
        assert!(!layout.is_xl("sd15.ckpt"));

        let snapshot = layout.snapshot_dir("custom.ckpt");
        std::fs::create_dir_all(snapshot.join("text_encoder_2")).unwrap();
        std::fs::write(snapshot.join(MODEL_INDEX), "{}").unwrap();
        assert!(layout.is_xl("custom.ckpt"));
        assert_eq!(layout.existing_snapshot("custom.ckpt"), Some(snapshot));
    }
}
