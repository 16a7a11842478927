pub mod cancel;
pub mod digest;
pub mod error;
pub mod glb;
pub mod guard;
pub mod manifest;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod profile;
pub mod publish;
pub mod sandbox;
pub mod scheduler;
pub mod stages;
pub mod validation;

pub use cancel::CancellationToken;
pub use error::{ErrorKind, PipelineError, StageError};
pub use manifest::Manifest;
pub use pipeline::{Pipeline, PipelineConfig, RunOutcome, StageResult};
pub use profile::{FeatureFlags, QualityPreset, QualityProfile, StageKind};
