use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::{AssetCacheOptions, CURRENT_LAYOUT};
use crate::storage::PinataCredentials;

const CONFIG_FILE: &str = "config.json";
const CACHE_DIR: &str = "models";
const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSettings {
    pub cache_root: PathBuf,
    pub gateway_url: String,
    pub pinning_api_url: String,
    pub database_url: Option<String>,
    pub inference_program: PathBuf,
    pub inference_args: Vec<String>,
    pub inference_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub max_concurrent_inference: usize,
    pub max_images_per_request: u32,
    pub max_cache_age_secs: u64,
    pub sweep_interval_secs: u64,
    pub archive_strip_components: u8,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            gateway_url: "https://gateway.pinata.cloud".into(),
            pinning_api_url: "https://api.pinata.cloud".into(),
            database_url: None,
            inference_program: PathBuf::from("python3"),
            inference_args: vec!["scripts/inference.py".into()],
            inference_timeout_secs: 600,
            fetch_timeout_secs: 300,
            max_concurrent_inference: 1,
            max_images_per_request: 8,
            max_cache_age_secs: 7 * DAY_SECS,
            sweep_interval_secs: 60 * 60,
            archive_strip_components: 0,
        }
    }
}

impl ServiceSettings {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cache_options(&self) -> AssetCacheOptions {
        AssetCacheOptions {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            strip_components: self.archive_strip_components,
            layout: CURRENT_LAYOUT,
        }
    }
}

/// Credentials and endpoints that only ever come from the environment.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub pinata: Option<PinataCredentials>,
    pub database_url: Option<String>,
    pub database_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let pinata = match (non_empty("PINATA_API_KEY"), non_empty("PINATA_API_SECRET")) {
            (Some(api_key), Some(api_secret)) => Some(PinataCredentials {
                api_key,
                api_secret,
            }),
            _ => None,
        };
        Self {
            pinata,
            database_url: non_empty("FIREBASE_DATABASE_URL"),
            database_token: non_empty("FIREBASE_AUTH_TOKEN"),
        }
    }

    /// The environment wins over the settings file.
    pub fn database_url<'a>(&'a self, settings: &'a ServiceSettings) -> Option<&'a str> {
        self.database_url
            .as_deref()
            .or(settings.database_url.as_deref())
    }
}

pub struct SettingsManager {
    path: PathBuf,
    inner: RwLock<ServiceSettings>,
}

impl SettingsManager {
    /// Loads `config.json` from the platform config directory.
    pub fn new() -> Result<Self> {
        Self::open(resolve_config_path()?)
    }

    /// Loads settings from `path`; a missing file means defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = load_settings(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn read(&self) -> ServiceSettings {
        self.inner.read().clone()
    }

    pub fn write(&self, settings: ServiceSettings) -> Result<()> {
        let mut guard = self.inner.write();
        persist_settings(self.path.as_path(), &settings)?;
        *guard = settings;
        Ok(())
    }

    /// Writes the current settings out unless the file already exists.
    /// Returns whether a file was written.
    pub fn init(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        persist_settings(self.path.as_path(), &self.inner.read())?;
        Ok(true)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "LoraGen", "lora-gen")
}

fn default_cache_root() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join(CACHE_DIR))
        .unwrap_or_else(|| PathBuf::from(CACHE_DIR))
}

fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs().context("missing project directories")?;
    Ok(project_dirs.config_dir().join(CONFIG_FILE))
}

fn load_settings(path: &Path) -> Result<ServiceSettings> {
    if !path.exists() {
        return Ok(ServiceSettings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("config json {path:?} could not be parsed"))
}

fn persist_settings(path: &Path, settings: &ServiceSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::open(dir.path().join("config.json")).unwrap();
        let settings = manager.read();
        assert_eq!(settings.max_cache_age(), Duration::from_secs(7 * DAY_SECS));
        assert_eq!(settings.inference_args, vec!["scripts/inference.py".to_string()]);
        assert_eq!(settings.max_concurrent_inference, 1);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "cacheRoot": "/srv/models", "inferenceTimeoutSecs": 30, "archiveStripComponents": 1 }"#,
        )
        .unwrap();

        let settings = SettingsManager::open(&path).unwrap().read();
        assert_eq!(settings.cache_root, PathBuf::from("/srv/models"));
        assert_eq!(settings.inference_timeout(), Duration::from_secs(30));
        assert_eq!(settings.cache_options().strip_components, 1);
        assert_eq!(settings.gateway_url, "https://gateway.pinata.cloud");
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(SettingsManager::open(&path).is_err());
    }

    #[test]
    fn write_and_init_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let manager = SettingsManager::open(&path).unwrap();
        assert!(manager.init().unwrap());
        assert!(!manager.init().unwrap());

        let mut settings = manager.read();
        settings.max_images_per_request = 2;
        manager.write(settings.clone()).unwrap();

        assert_eq!(SettingsManager::open(&path).unwrap().read(), settings);
    }

    #[test]
    fn secrets_come_from_the_environment() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PINATA_API_KEY", "key"),
            ("PINATA_API_SECRET", "secret"),
            ("FIREBASE_DATABASE_URL", "https://db.example.com"),
            ("FIREBASE_AUTH_TOKEN", " "),
        ]);
        let secrets = Secrets::from_lookup(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(secrets.pinata.as_ref().map(|c| c.api_key.as_str()), Some("key"));
        assert_eq!(secrets.database_token, None);

        let mut settings = ServiceSettings::default();
        settings.database_url = Some("https://file.example.com".into());
        assert_eq!(secrets.database_url(&settings), Some("https://db.example.com"));
        assert_eq!(
            Secrets::default().database_url(&settings),
            Some("https://file.example.com")
        );

        let half = Secrets::from_lookup(|key| (key == "PINATA_API_KEY").then(|| "key".to_string()));
        assert!(half.pinata.is_none());
    }
}
