use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Training state of a fine-tuned model as recorded under
/// `fine-tune/{owner}/{modelName}`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrainingStatus::Pending => "pending",
            TrainingStatus::Processing => "processing",
            TrainingStatus::Completed => "completed",
            TrainingStatus::Failed => "failed",
            TrainingStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Model metadata written by the training pipeline. Only the fields the
/// generation path needs are typed; the rest is carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    #[serde(default)]
    pub status: TrainingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_cid: Option<String>,
    /// Older records store the archive id under this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ipfs_hash: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelRecord {
    pub fn content_id(&self) -> Option<&str> {
        self.model_cid
            .as_deref()
            .or(self.model_ipfs_hash.as_deref())
            .map(str::trim)
            .filter(|cid| !cid.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub model_owner: String,
    pub model_name: String,
    pub prompt: String,
    pub count: u32,
    /// Wallet asking for the images; the model owner when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
}

impl GenerationRequest {
    pub fn new(
        model_owner: impl Into<String>,
        model_name: impl Into<String>,
        prompt: impl Into<String>,
        count: u32,
    ) -> Self {
        Self {
            model_owner: model_owner.into(),
            model_name: model_name.into(),
            prompt: prompt.into(),
            count,
            requester: None,
        }
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn requester(&self) -> &str {
        self.requester.as_deref().unwrap_or(&self.model_owner)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedArtifact {
    #[serde(rename = "cid")]
    pub content_id: String,
    pub prompt: String,
    pub url: String,
    #[serde(rename = "modelName")]
    pub source_model: String,
    #[serde(rename = "modelOwner")]
    pub owner: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Ledger entry for one orchestration run, stored at `model-usage/{usageId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub usage_id: String,
    pub model_name: String,
    pub model_owner: String,
    pub user_address: String,
    pub prompt: String,
    pub num_of_images: u32,
    #[serde(default)]
    pub images: Vec<GeneratedArtifact>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_training_records() {
        let record: ModelRecord = serde_json::from_value(json!({
            "status": "completed",
            "modelIpfsHash": "QmLegacy",
            "trainedAt": "2024-05-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.status, TrainingStatus::Completed);
        assert_eq!(record.content_id(), Some("QmLegacy"));
        assert!(record.extra.contains_key("trainedAt"));

        let record: ModelRecord =
            serde_json::from_value(json!({ "status": "queued", "modelCid": " " })).unwrap();
        assert_eq!(record.status, TrainingStatus::Unknown);
        assert_eq!(record.content_id(), None);
    }

    #[test]
    fn artifact_uses_ledger_field_names() {
        let artifact = GeneratedArtifact {
            content_id: "bafk1".into(),
            prompt: "p".into(),
            url: "https://gateway.pinata.cloud/ipfs/bafk1".into(),
            source_model: "m1".into(),
            owner: "0xA".into(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["cid"], "bafk1");
        assert_eq!(value["modelName"], "m1");
        assert_eq!(value["modelOwner"], "0xA");
        assert_eq!(value["createdAt"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn requester_defaults_to_owner() {
        let request = GenerationRequest::new("0xA", "m1", "p", 1);
        assert_eq!(request.requester(), "0xA");
        assert_eq!(request.with_requester("0xB").requester(), "0xB");
    }
}
