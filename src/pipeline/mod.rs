//! Pipeline lifecycle: construction, caching, memory residency, generation.

pub mod backend;
pub mod cache_key;
pub mod dry_run;
pub mod generation;
pub mod keepalive;
pub mod layout;
pub mod lazy;
pub mod model_manager;
pub mod settings;
pub mod status;
pub mod variant;

pub use backend::{CallArgs, DiffusionPipeline, Generator, PipelineBackend, PipelineOutput, StepProgress};
pub use dry_run::{DryRunBackend, DryRunHandle, DryRunState};
pub use generation::GenerationRequest;
pub use model_manager::{AppliedChanges, ManagerStatus, PipelineManager};
pub use settings::ConfigurationUpdate;
pub use status::{EngineStatus, EngineStatusQuery};
pub use variant::{PipelineState, SwapPolicy, Variant};
