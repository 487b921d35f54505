use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::generation::GenerationService;
use crate::inference::InferenceRunner;
use crate::models::{AssetCache, CacheSweeper};
use crate::storage::{ContentStore, Database, MemoryDatabase, PinataStore, RestDatabase};

use super::settings::{Secrets, ServiceSettings, SettingsManager};

/// The wired-up service: one cache, one runner, one orchestrator, built from
/// the settings file plus environment secrets.
pub struct AppState {
    settings: Arc<SettingsManager>,
    store: Arc<PinataStore>,
    database: Arc<dyn Database>,
    cache: Arc<AssetCache>,
    runner: Arc<InferenceRunner>,
    generation: Arc<GenerationService>,
}

impl AppState {
    pub fn new(settings: Arc<SettingsManager>, secrets: Secrets) -> Result<Self> {
        let config = settings.read();

        if secrets.pinata.is_none() {
            warn!("PINATA_API_KEY/PINATA_API_SECRET not set; publishing will be rejected");
        }
        let store = Arc::new(
            PinataStore::new(
                &config.pinning_api_url,
                &config.gateway_url,
                secrets.pinata.clone(),
            )
            .context("building pinning client")?,
        );

        let database = build_database(&config, &secrets)?;

        let cache = Arc::new(AssetCache::with_options(
            &config.cache_root,
            store.clone() as Arc<dyn ContentStore>,
            config.cache_options(),
        ));

        let runner = Arc::new(
            InferenceRunner::new(&config.inference_program)
                .with_args(config.inference_args.iter().cloned())
                .with_timeout(config.inference_timeout())
                .with_max_concurrent(config.max_concurrent_inference),
        );

        let generation = Arc::new(
            GenerationService::new(
                database.clone(),
                store.clone(),
                cache.clone(),
                runner.clone(),
            )
            .with_max_images(config.max_images_per_request),
        );

        info!(
            cache_root = ?config.cache_root,
            program = ?config.inference_program,
            "service initialized"
        );
        Ok(Self {
            settings,
            store,
            database,
            cache,
            runner,
            generation,
        })
    }

    pub fn settings_manager(&self) -> Arc<SettingsManager> {
        self.settings.clone()
    }

    pub fn cache(&self) -> Arc<AssetCache> {
        self.cache.clone()
    }

    pub fn database(&self) -> Arc<dyn Database> {
        self.database.clone()
    }

    pub fn runner(&self) -> Arc<InferenceRunner> {
        self.runner.clone()
    }

    pub fn generation(&self) -> Arc<GenerationService> {
        self.generation.clone()
    }

    /// Checks the pinning credentials. Failure is only logged: reads through
    /// the gateway still work without them.
    pub async fn probe_store(&self) -> bool {
        match self.store.test_authentication().await {
            Ok(()) => {
                info!("pinning service authentication succeeded");
                true
            }
            Err(error) => {
                warn!("pinning service authentication failed: {error}");
                false
            }
        }
    }

    pub fn spawn_sweeper(&self) -> CacheSweeper {
        let config = self.settings.read();
        CacheSweeper::spawn(
            self.cache.clone(),
            config.sweep_interval(),
            config.max_cache_age(),
        )
    }
}

fn build_database(config: &ServiceSettings, secrets: &Secrets) -> Result<Arc<dyn Database>> {
    match secrets.database_url(config) {
        Some(url) => {
            let database = RestDatabase::new(url, secrets.database_token.clone())
                .with_context(|| format!("connecting to database at {url}"))?;
            Ok(Arc::new(database))
        }
        None => {
            warn!("no database url configured; using a process-local database");
            Ok(Arc::new(MemoryDatabase::new()))
        }
    }
}
