//! Model asset cache and inference pipeline for LoRA image generation.
//!
//! A generation request names a trained model; the model archive is fetched
//! from IPFS by content id, unpacked and validated into a local cache, then an
//! external script produces each image, which is pinned back to IPFS and
//! recorded in the usage ledger.

pub mod core;
pub mod error;
pub mod generation;
pub mod inference;
pub mod models;
pub mod storage;
