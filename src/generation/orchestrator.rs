use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{
    GeneratedArtifact, GenerationRequest, ModelRecord, TrainingStatus, UsageRecord,
};
use crate::error::{DatabaseError, GenerationError};
use crate::inference::ImageGenerator;
use crate::models::AssetCache;
use crate::storage::{ContentStore, Database};

pub const DEFAULT_MAX_IMAGES: u32 = 8;
const USAGE_ROOT: &str = "model-usage";

pub fn model_record_path(owner: &str, model_name: &str) -> String {
    format!("fine-tune/{owner}/{model_name}")
}

pub fn usage_path(usage_id: &str) -> String {
    format!("{USAGE_ROOT}/{usage_id}")
}

/// Drives one generation request end to end: model lookup, asset resolution,
/// sequential generation and publication, then the usage ledger entry.
pub struct GenerationService {
    database: Arc<dyn Database>,
    store: Arc<dyn ContentStore>,
    cache: Arc<AssetCache>,
    generator: Arc<dyn ImageGenerator>,
    max_images: u32,
}

impl GenerationService {
    pub fn new(
        database: Arc<dyn Database>,
        store: Arc<dyn ContentStore>,
        cache: Arc<AssetCache>,
        generator: Arc<dyn ImageGenerator>,
    ) -> Self {
        Self {
            database,
            store,
            cache,
            generator,
            max_images: DEFAULT_MAX_IMAGES,
        }
    }

    pub fn with_max_images(mut self, max_images: u32) -> Self {
        self.max_images = max_images.max(1);
        self
    }

    pub async fn run(&self, request: &GenerationRequest) -> Result<UsageRecord, GenerationError> {
        self.check(request)?;
        let owner = request.model_owner.as_str();
        let model_name = request.model_name.as_str();

        let record = self.model_record(owner, model_name).await?;
        if record.status != TrainingStatus::Completed {
            info!(owner, model_name, status = %record.status, "model not ready for generation");
            return Err(GenerationError::ModelNotReady {
                owner: owner.to_string(),
                model_name: model_name.to_string(),
                status: record.status,
            });
        }
        let content_id =
            record
                .content_id()
                .ok_or_else(|| GenerationError::MissingModelContentId {
                    owner: owner.to_string(),
                    model_name: model_name.to_string(),
                })?;

        let model_path = self.cache.resolve(content_id).await?;
        info!(owner, model_name, content_id, count = request.count, "generating images");

        let mut images = Vec::with_capacity(request.count as usize);
        for index in 0..request.count {
            match self.generate_one(request, &model_path, index).await {
                Ok(artifact) => images.push(artifact),
                Err(err) => {
                    let published: Vec<&str> =
                        images.iter().map(|image| image.content_id.as_str()).collect();
                    warn!(
                        owner,
                        model_name,
                        index,
                        ?published,
                        "generation stopped; already published images are kept"
                    );
                    error!(owner, model_name, "image generation failed: {err}");
                    return Err(err);
                }
            }
        }

        let usage = UsageRecord {
            usage_id: Uuid::new_v4().to_string(),
            model_name: model_name.to_string(),
            model_owner: owner.to_string(),
            user_address: request.requester().to_string(),
            prompt: request.prompt.clone(),
            num_of_images: request.count,
            images,
            timestamp: OffsetDateTime::now_utc(),
        };
        let value = serde_json::to_value(&usage).map_err(|err| DatabaseError::Shape {
            path: usage_path(&usage.usage_id),
            reason: err.to_string(),
        })?;
        self.database.set(&usage_path(&usage.usage_id), value).await?;
        info!(usage_id = %usage.usage_id, images = usage.images.len(), "usage recorded");
        Ok(usage)
    }

    /// Every usage record written for `user_address`, newest first.
    pub async fn usage_for(
        &self,
        user_address: &str,
    ) -> Result<Vec<UsageRecord>, GenerationError> {
        let Some(all) = self.database.get(USAGE_ROOT).await? else {
            return Ok(Vec::new());
        };
        let Value::Object(entries) = all else {
            return Err(DatabaseError::Shape {
                path: USAGE_ROOT.to_string(),
                reason: "expected an object of usage records".into(),
            }
            .into());
        };

        let mut records = Vec::new();
        for (usage_id, entry) in entries {
            if entry.get("userAddress").and_then(Value::as_str) != Some(user_address) {
                continue;
            }
            match serde_json::from_value::<UsageRecord>(with_usage_id(entry, &usage_id)) {
                Ok(record) => records.push(record),
                Err(err) => warn!(usage_id = %usage_id, "skipping unreadable usage record: {err}"),
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    fn check(&self, request: &GenerationRequest) -> Result<(), GenerationError> {
        if request.model_owner.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "model owner is required".into(),
            ));
        }
        if request.model_name.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "model name is required".into(),
            ));
        }
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest("prompt is required".into()));
        }
        if request.count == 0 || request.count > self.max_images {
            return Err(GenerationError::InvalidRequest(format!(
                "count must be between 1 and {}, got {}",
                self.max_images, request.count
            )));
        }
        Ok(())
    }

    async fn model_record(
        &self,
        owner: &str,
        model_name: &str,
    ) -> Result<ModelRecord, GenerationError> {
        let path = model_record_path(owner, model_name);
        let value = self
            .database
            .get(&path)
            .await?
            .ok_or_else(|| GenerationError::ModelNotFound {
                owner: owner.to_string(),
                model_name: model_name.to_string(),
            })?;
        serde_json::from_value(value).map_err(|err| {
            GenerationError::Database(DatabaseError::Shape {
                path,
                reason: err.to_string(),
            })
        })
    }

    async fn generate_one(
        &self,
        request: &GenerationRequest,
        model_path: &std::path::Path,
        index: u32,
    ) -> Result<GeneratedArtifact, GenerationError> {
        let image = self.generator.generate(model_path, &request.prompt).await?;
        let name = format!(
            "{}_generated_{}_{}",
            request.model_name,
            unix_millis(),
            index
        );
        let content_id = self
            .store
            .pin(image, &name)
            .await
            .map_err(GenerationError::Publish)?;
        debug!(content_id = %content_id, name = %name, "published generated image");
        Ok(GeneratedArtifact {
            url: self.store.gateway_url(&content_id),
            content_id,
            prompt: request.prompt.clone(),
            source_model: request.model_name.clone(),
            owner: request.model_owner.clone(),
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

fn with_usage_id(mut entry: Value, usage_id: &str) -> Value {
    if let Value::Object(map) = &mut entry {
        map.entry("usageId")
            .or_insert_with(|| Value::String(usage_id.to_string()));
    }
    entry
}

fn unix_millis() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}
