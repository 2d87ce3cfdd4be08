//! Typed configuration values and the configuration update message.
//!
//! Every identifier (precision, device, scheduler, VAE, ControlNet) is parsed
//! into an enum up front, so an unknown name is rejected before any pipeline
//! state is touched.

use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::pipeline::variant::SwapPolicy;

fn parse_named<T: DeserializeOwned>(what: &str, value: &str) -> Result<T> {
    serde_json::from_value(Value::String(value.trim().to_lowercase()))
        .map_err(|_| EngineError::Configuration(format!("unknown {what} '{value}'")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "float16", alias = "half")]
    Half,
    #[serde(rename = "float32", alias = "float")]
    Float,
    #[serde(rename = "bfloat16")]
    BFloat,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Half => "float16",
            Precision::Float => "float32",
            Precision::BFloat => "bfloat16",
        }
    }

    /// Precision used when none is configured.
    pub fn default_for(device: Device) -> Self {
        match device {
            Device::Cpu => Precision::BFloat,
            Device::Mps => Precision::Float,
            Device::Cuda | Device::Dml => Precision::Half,
        }
    }
}

impl FromStr for Precision {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        parse_named("precision", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Mps,
    Dml,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Dml => "dml",
        }
    }
}

impl FromStr for Device {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        parse_named("device", s)
    }
}

/// Where a constructed pipeline lives: the compute device or host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Device(Device),
    Host,
}

/// Noise schedulers selectable by short name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    Ddim,
    Ddpm,
    Deis,
    Dpmsm,
    Dpmss,
    Heun,
    Dpmd,
    Adpmd,
    Dpmsde,
    Unipc,
    Lmsd,
    Pndm,
    Eds,
    Eads,
}

impl FromStr for Scheduler {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        parse_named("scheduler", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaeChoice {
    Ema,
    Mse,
    Xl,
}

impl VaeChoice {
    /// An XL decoder only fits XL models and vice versa.
    pub fn compatible_with(self, model_is_xl: bool) -> bool {
        (self == VaeChoice::Xl) == model_is_xl
    }
}

impl FromStr for VaeChoice {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        parse_named("vae", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Controlnet {
    Canny,
    Tile,
    Mlsd,
    Hed,
    Scribble,
    Inpaint,
    Depth,
    Normal,
    Pose,
}

impl Controlnet {
    pub fn as_str(self) -> &'static str {
        match self {
            Controlnet::Canny => "canny",
            Controlnet::Tile => "tile",
            Controlnet::Mlsd => "mlsd",
            Controlnet::Hed => "hed",
            Controlnet::Scribble => "scribble",
            Controlnet::Inpaint => "inpaint",
            Controlnet::Depth => "depth",
            Controlnet::Normal => "normal",
            Controlnet::Pose => "pose",
        }
    }
}

impl FromStr for Controlnet {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        parse_named("controlnet", s)
    }
}

/// Which family an auxiliary weight belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightKind {
    Lora,
    Lycoris,
    Inversion,
}

/// A fine-tuning weight file and its strength.
///
/// Accepts `"name"`, `["name", 0.5]` or `{"name": "name", "weight": 0.5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "AuxiliaryWeightRepr")]
pub struct AuxiliaryWeight {
    pub name: String,
    pub weight: f32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AuxiliaryWeightRepr {
    Name(String),
    Pair(String, f32),
    Full {
        name: String,
        #[serde(default = "default_weight")]
        weight: f32,
    },
}

fn default_weight() -> f32 {
    1.0
}

impl From<AuxiliaryWeightRepr> for AuxiliaryWeight {
    fn from(repr: AuxiliaryWeightRepr) -> Self {
        match repr {
            AuxiliaryWeightRepr::Name(name) => AuxiliaryWeight { name, weight: 1.0 },
            AuxiliaryWeightRepr::Pair(name, weight) | AuxiliaryWeightRepr::Full { name, weight } => {
                AuxiliaryWeight { name, weight }
            }
        }
    }
}

impl AuxiliaryWeight {
    pub fn new(name: impl Into<String>, weight: f32) -> Self {
        AuxiliaryWeight {
            name: name.into(),
            weight,
        }
    }

    /// File stem used in cache keys, so `dir/style.safetensors` and `style` agree.
    pub fn key_name(&self) -> String {
        stem_of(&self.name)
    }
}

pub(crate) fn stem_of(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string())
}

/// The three auxiliary weight lists applied on top of a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryWeights {
    pub lora: Vec<AuxiliaryWeight>,
    pub lycoris: Vec<AuxiliaryWeight>,
    pub inversion: Vec<String>,
}

impl AuxiliaryWeights {
    pub fn is_empty(&self) -> bool {
        self.lora.is_empty() && self.lycoris.is_empty() && self.inversion.is_empty()
    }
}

/// Defaults for the refinement pass, overridable per call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerDefaults {
    pub strength: f32,
    pub guidance_scale: f32,
    pub aesthetic_score: f32,
    pub negative_aesthetic_score: f32,
}

impl Default for RefinerDefaults {
    fn default() -> Self {
        Self {
            strength: 0.3,
            guidance_scale: 5.0,
            aesthetic_score: 6.0,
            negative_aesthetic_score: 2.5,
        }
    }
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// A partial configuration change.
///
/// Absent fields are untouched; `null` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigurationUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub refiner: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub inpainter: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub refiner_size: Option<Option<u32>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub inpainter_size: Option<Option<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunking_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunking_blur: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora: Option<Vec<AuxiliaryWeight>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lycoris: Option<Vec<AuxiliaryWeight>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inversion: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub precision: Option<Option<Precision>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub device: Option<Option<Device>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub scheduler: Option<Option<Scheduler>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub multi_scheduler: Option<Option<Scheduler>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub vae: Option<Option<VaeChoice>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub controlnet: Option<Option<Controlnet>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub seed: Option<Option<u64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_accelerated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerated_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_switch: Option<SwapPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refiner_defaults: Option<RefinerDefaults>,
}

impl ConfigurationUpdate {
    /// Parse an update, reporting any bad field as a configuration error.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(|e| EngineError::Configuration(e.to_string()))
    }
}
