//! Engine configuration: defaults, JSON file loading, environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::log_debug;
use crate::pipeline::settings::{
    AuxiliaryWeights, Controlnet, Device, Precision, RefinerDefaults, Scheduler, VaeChoice,
};
use crate::pipeline::variant::{Stage, SwapPolicy};

/// Overrides the engine root directory.
pub const ROOT_ENV: &str = "DIFFUSION_ENGINE_ROOT";

pub const DEFAULT_SIZE: u32 = 512;
pub const DEFAULT_XL_SIZE: u32 = 1024;
pub const DEFAULT_CHUNK: u32 = 64;

fn default_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("diffusion-engine"),
        None => PathBuf::from(".diffusion-engine"),
    }
}

/// Directories derived from the engine root.
#[derive(Debug, Clone, PartialEq)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub cache: PathBuf,
    pub checkpoint: PathBuf,
    pub lora: PathBuf,
    pub lycoris: PathBuf,
    pub inversion: PathBuf,
    pub other: PathBuf,
}

impl EnginePaths {
    pub fn new(root: &Path) -> Self {
        EnginePaths {
            root: root.to_path_buf(),
            cache: root.join("cache"),
            checkpoint: root.join("checkpoint"),
            lora: root.join("lora"),
            lycoris: root.join("lycoris"),
            inversion: root.join("inversion"),
            other: root.join("other"),
        }
    }

    /// Resolve a bare file name against a directory; paths with separators pass through.
    pub fn resolve(dir: &Path, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() || path.components().count() > 1 {
            path.to_path_buf()
        } else {
            dir.join(name)
        }
    }
}

/// Controller-side timings for spawning, polling and stopping the worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorTimings {
    pub poll_interval_ms: u64,
    pub spawn_settle_ms: u64,
    pub stop_grace_ms: u64,
    pub terminate_timeout_ms: u64,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            spawn_settle_ms: 400,
            stop_grace_ms: 200,
            terminate_timeout_ms: 10_000,
        }
    }
}

impl SupervisorTimings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn spawn_settle(&self) -> Duration {
        Duration::from_millis(self.spawn_settle_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Worker-side heartbeat timings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveTimings {
    pub tick_ms: u64,
    pub interval_ms: u64,
}

impl Default for KeepaliveTimings {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            interval_ms: 15_000,
        }
    }
}

impl KeepaliveTimings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub root: PathBuf,

    pub model: Option<String>,
    pub refiner: Option<String>,
    pub inpainter: Option<String>,

    pub size: u32,
    pub refiner_size: Option<u32>,
    pub inpainter_size: Option<u32>,
    pub chunking_size: u32,
    pub chunking_blur: u32,

    pub precision: Option<Precision>,
    pub device: Option<Device>,
    pub safe: bool,

    pub scheduler: Option<Scheduler>,
    pub multi_scheduler: Option<Scheduler>,
    pub vae: Option<VaeChoice>,
    pub controlnet: Option<Controlnet>,
    pub seed: Option<u64>,

    #[serde(flatten)]
    pub weights: AuxiliaryWeights,

    pub build_accelerated: bool,
    pub accelerated_stages: Vec<Stage>,
    pub always_cache: Option<bool>,

    pub pipeline_switch: SwapPolicy,
    pub refiner_defaults: RefinerDefaults,

    pub supervisor: SupervisorTimings,
    pub keepalive: KeepaliveTimings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            model: None,
            refiner: None,
            inpainter: None,
            size: DEFAULT_SIZE,
            refiner_size: None,
            inpainter_size: None,
            chunking_size: DEFAULT_CHUNK,
            chunking_blur: DEFAULT_CHUNK,
            precision: None,
            device: None,
            safe: true,
            scheduler: None,
            multi_scheduler: None,
            vae: None,
            controlnet: None,
            seed: None,
            weights: AuxiliaryWeights::default(),
            build_accelerated: false,
            accelerated_stages: vec![Stage::Denoiser],
            always_cache: None,
            pipeline_switch: SwapPolicy::Offload,
            refiner_defaults: RefinerDefaults::default(),
            supervisor: SupervisorTimings::default(),
            keepalive: KeepaliveTimings::default(),
        }
    }
}

impl EngineConfig {
    pub fn paths(&self) -> EnginePaths {
        EnginePaths::new(&self.root)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| EngineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size % 8 != 0 {
            return Err(EngineError::Configuration(format!(
                "size must be a positive multiple of 8, got {}",
                self.size
            )));
        }
        if self.device == Some(Device::Cpu) && self.precision.is_some_and(|p| p != Precision::BFloat) {
            return Err(EngineError::Configuration(
                "CPU-based diffusion can only use bfloat16".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(root) = std::env::var_os(ROOT_ENV) {
            if !root.is_empty() {
                self.root = PathBuf::from(root);
            }
        }
    }
}

/// Load configuration from an optional JSON file, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => {
            log_debug!("config", "Loading configuration from {}", path.display());
            let json = std::fs::read_to_string(path)?;
            EngineConfig::from_json_str(&json)?
        }
        None => EngineConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.size, 512);
        assert_eq!(config.chunking_size, 64);
        assert_eq!(config.chunking_blur, 64);
        assert!(config.safe);
        assert_eq!(config.pipeline_switch, SwapPolicy::Offload);
        assert_eq!(config.accelerated_stages, vec![Stage::Denoiser]);
        assert_eq!(config.refiner_defaults.strength, 0.3);
        assert_eq!(config.keepalive.interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"root": "/srv/engine", "model": "sd15.ckpt", "lora": [["style", 0.5]], "pipeline_switch": "unload"}"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/engine"));
        assert_eq!(config.model.as_deref(), Some("sd15.ckpt"));
        assert_eq!(config.weights.lora.len(), 1);
        assert_eq!(config.pipeline_switch, SwapPolicy::Unload);
        assert_eq!(config.size, 512);
        assert_eq!(config.paths().lora, PathBuf::from("/srv/engine/lora"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"scheduler": "warp"}"#),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"size": 500}"#),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"device": "cpu", "precision": "half"}"#),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_paths() {
        let dir = Path::new("/engine/lora");
        assert_eq!(EnginePaths::resolve(dir, "style.safetensors"), dir.join("style.safetensors"));
        assert_eq!(
            EnginePaths::resolve(dir, "/abs/style.safetensors"),
            PathBuf::from("/abs/style.safetensors")
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = std::env::temp_dir().join(format!("diffusion_engine_config_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.json");
        std::fs::write(&path, r#"{"size": 768, "safe": false}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.size, 768);
        assert!(!config.safe);

        assert!(load_config(Some(&dir.join("missing.json"))).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
