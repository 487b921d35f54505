mod extract;
mod manager;
mod metadata;
mod service;
mod validate;

pub use extract::{extract, extract_with, ArchiveFormat};
pub use manager::{validate_content_id, AssetCache, AssetCacheOptions, AssetState, ModelAsset};
pub use metadata::{compute_sha256, sha256_hex};
pub use service::CacheSweeper;
pub use validate::{validate, AssetLayout, CURRENT_LAYOUT, LORA_LAYOUT_V1};
