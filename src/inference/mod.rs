mod payload;
mod runner;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::InferenceError;

pub use payload::parse_payload;
pub use runner::InferenceRunner;

/// Produces one image from a ready model directory and a prompt.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, model_path: &Path, prompt: &str) -> Result<Bytes, InferenceError>;
}
