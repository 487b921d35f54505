use std::path::Path;

/// A versioned description of the files a usable model directory contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetLayout {
    pub version: u32,
    pub required_files: &'static [&'static str],
}

/// LoRA fine-tunes as produced by the training pipeline.
pub const LORA_LAYOUT_V1: AssetLayout = AssetLayout {
    version: 1,
    required_files: &["pytorch_lora_weights.safetensors", "config.json"],
};

pub const CURRENT_LAYOUT: AssetLayout = LORA_LAYOUT_V1;

impl AssetLayout {
    /// Required files absent from `model_dir`. Everything is missing when the
    /// directory itself cannot be read.
    pub fn missing_files(&self, model_dir: &Path) -> Vec<&'static str> {
        if !model_dir.is_dir() {
            return self.required_files.to_vec();
        }
        self.required_files
            .iter()
            .copied()
            .filter(|name| !model_dir.join(name).is_file())
            .collect()
    }

    pub fn validate(&self, model_dir: &Path) -> bool {
        self.missing_files(model_dir).is_empty()
    }
}

pub fn validate(model_dir: &Path) -> bool {
    CURRENT_LAYOUT.validate(model_dir)
}
