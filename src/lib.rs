//! Diffusion engine: a supervised worker process that owns diffusion
//! pipelines, and the controller that talks to it.

pub mod config;
pub mod error;
pub mod imaging;
pub mod logger;
pub mod pipeline;
pub mod worker;

pub use config::{load_config, EngineConfig};
pub use error::{EngineError, ErrorKind, Result};
pub use pipeline::{GenerationRequest, PipelineManager};
pub use worker::Dispatcher;
