mod orchestrator;
mod types;

pub use orchestrator::{model_record_path, usage_path, GenerationService, DEFAULT_MAX_IMAGES};
pub use types::{GeneratedArtifact, GenerationRequest, ModelRecord, TrainingStatus, UsageRecord};
