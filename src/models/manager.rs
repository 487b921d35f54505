use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::{
    extract::{extract_with, ArchiveFormat},
    metadata::compute_sha256,
    validate::{AssetLayout, CURRENT_LAYOUT},
};
use crate::error::{CacheError, ExtractError};
use crate::storage::ContentStore;

const ARCHIVE_STAGING_NAME: &str = "model.download";
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

static CONTENT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{1,128}$").expect("content id pattern compiles"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AssetState {
    Missing,
    Downloading,
    Extracting,
    Validating,
    Ready,
    Invalid,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAsset {
    pub content_id: String,
    pub local_path: PathBuf,
    pub state: AssetState,
    #[serde(default)]
    pub archive_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_checksum: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ModelAsset {
    fn new(content_id: &str, local_path: &Path, state: AssetState) -> Self {
        Self {
            content_id: content_id.to_string(),
            local_path: local_path.to_path_buf(),
            state,
            archive_size_bytes: 0,
            archive_checksum: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetCacheOptions {
    pub fetch_timeout: Duration,
    pub strip_components: u8,
    pub layout: AssetLayout,
}

impl Default for AssetCacheOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            strip_components: 0,
            layout: CURRENT_LAYOUT,
        }
    }
}

/// On-disk cache of extracted models, one directory per content id under
/// `root`. Resolution of a given id is single-flight: concurrent callers wait
/// for the first one and then observe its result as a cache hit.
pub struct AssetCache {
    root: PathBuf,
    store: Arc<dyn ContentStore>,
    options: AssetCacheOptions,
    assets: Mutex<HashMap<String, ModelAsset>>,
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held entry lock; cloned into blocking work that must finish before the
/// entry can be claimed again.
type EntryGuard = Arc<OwnedMutexGuard<()>>;

/// Exclusive claim on one cache entry. Dropping it releases the claim and
/// forgets the per-entry lock once nobody else is waiting on it.
struct EntryClaim<'a> {
    cache: &'a AssetCache,
    content_id: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<EntryGuard>,
}

impl EntryClaim<'_> {
    /// Keeps the entry locked for as long as the returned guard lives, even
    /// after this claim is dropped.
    fn share(&self) -> Option<EntryGuard> {
        self.guard.clone()
    }
}

impl Drop for EntryClaim<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut inflight = self.cache.inflight.lock();
        // one reference in the map, one here; a shared guard adds another
        if Arc::strong_count(&self.lock) <= 2 {
            inflight.remove(&self.content_id);
        }
    }
}

pub fn validate_content_id(content_id: &str) -> Result<(), CacheError> {
    if CONTENT_ID.is_match(content_id) {
        Ok(())
    } else {
        Err(CacheError::InvalidContentId(content_id.to_string()))
    }
}

impl AssetCache {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn ContentStore>) -> Self {
        Self::with_options(root, store, AssetCacheOptions::default())
    }

    pub fn with_options(
        root: impl Into<PathBuf>,
        store: Arc<dyn ContentStore>,
        options: AssetCacheOptions,
    ) -> Self {
        Self {
            root: root.into(),
            store,
            options,
            assets: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Deterministic location of an entry; does not check the id.
    pub fn entry_path(&self, content_id: &str) -> PathBuf {
        self.root.join(content_id)
    }

    pub fn asset(&self, content_id: &str) -> Option<ModelAsset> {
        self.assets.lock().get(content_id).cloned()
    }

    pub fn assets(&self) -> Vec<ModelAsset> {
        let mut assets: Vec<ModelAsset> = self.assets.lock().values().cloned().collect();
        assets.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        assets
    }

    /// Returns the path of a validated model directory for `content_id`,
    /// downloading and extracting it first unless a valid copy is cached.
    pub async fn resolve(&self, content_id: &str) -> Result<PathBuf, CacheError> {
        validate_content_id(content_id)?;
        let claim = self.claim(content_id).await;
        let path = self.entry_path(content_id);

        if self.is_valid(&path).await {
            debug!(content_id, path = ?path, "model cache hit");
            self.mark_ready_if_unknown(content_id, &path);
            return Ok(path);
        }

        if try_exists(&path).await {
            warn!(content_id, path = ?path, "discarding incomplete cache entry");
            self.set_state(content_id, &path, AssetState::Stale);
            remove_entry_dir(&path)
                .await
                .map_err(|source| CacheError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        self.populate(content_id, &path, &claim).await?;
        Ok(path)
    }

    /// Removes one entry, waiting for an in-flight resolution of it to finish.
    /// Returns whether anything was on disk.
    pub async fn evict(&self, content_id: &str) -> Result<bool, CacheError> {
        validate_content_id(content_id)?;
        let _claim = self.claim(content_id).await;
        let path = self.entry_path(content_id);
        let existed = try_exists(&path).await;
        if existed {
            remove_entry_dir(&path)
                .await
                .map_err(|source| CacheError::Io {
                    path: path.clone(),
                    source,
                })?;
            info!(content_id, "evicted cached model");
        }
        self.assets.lock().remove(content_id);
        Ok(existed)
    }

    /// Removes every entry last modified more than `max_age` ago.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize, CacheError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.sweep_before(cutoff).await
    }

    /// Removes every entry last modified before `cutoff`. Entries with a
    /// resolution in flight are left alone.
    pub async fn sweep_before(&self, cutoff: SystemTime) -> Result<usize, CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(CacheError::Io {
                        path: self.root.clone(),
                        source,
                    })
                }
            };
            let Ok(content_id) = entry.file_name().into_string() else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_dir() => metadata,
                Ok(_) => continue,
                Err(error) => {
                    warn!(content_id = %content_id, "failed to stat cache entry: {error}");
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(error) => {
                    warn!(
                        content_id = %content_id,
                        "cache entry has no modification time: {error}"
                    );
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            let Some(_claim) = self.try_claim(&content_id) else {
                debug!(content_id = %content_id, "skipping cache entry with resolution in flight");
                continue;
            };
            let path = entry.path();
            // a resolve may have rebuilt the entry between the stat and the claim
            if !expired(&path, cutoff).await {
                debug!(content_id = %content_id, "cache entry refreshed; keeping it");
                continue;
            }
            self.set_state(&content_id, &path, AssetState::Stale);
            match remove_entry_dir(&path).await {
                Ok(()) => {
                    self.assets.lock().remove(&content_id);
                    removed += 1;
                    info!(content_id = %content_id, "removed stale cached model");
                }
                Err(error) => {
                    warn!(content_id = %content_id, "failed to remove stale cached model: {error}")
                }
            }
        }
        Ok(removed)
    }

    /// Every directory currently on disk, with its validation state.
    pub async fn scan(&self) -> Result<Vec<ModelAsset>, CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut found = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(content_id) = entry.file_name().into_string() else {
                continue;
            };
            if !entry.file_type().await.map(|kind| kind.is_dir()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let asset = match self.asset(&content_id) {
                Some(known) => known,
                None => {
                    let state = if self.is_valid(&path).await {
                        AssetState::Ready
                    } else {
                        AssetState::Invalid
                    };
                    ModelAsset::new(&content_id, &path, state)
                }
            };
            found.push(asset);
        }
        found.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        Ok(found)
    }

    async fn populate(
        &self,
        content_id: &str,
        path: &Path,
        claim: &EntryClaim<'_>,
    ) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| CacheError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        self.set_state(content_id, path, AssetState::Downloading);
        info!(content_id, "downloading model archive");
        let fetched =
            tokio::time::timeout(self.options.fetch_timeout, self.store.fetch(content_id)).await;
        let bytes = match fetched {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) => {
                return Err(self
                    .abandon(content_id, path, fetch_error(content_id, error))
                    .await)
            }
            Err(_) => {
                let reason = format!("timed out after {:?}", self.options.fetch_timeout);
                return Err(self
                    .abandon(content_id, path, fetch_error(content_id, reason))
                    .await);
            }
        };

        let staging = path.join(ARCHIVE_STAGING_NAME);
        if let Err(error) = tokio::fs::write(&staging, &bytes).await {
            let reason = format!("writing archive to {staging:?}: {error}");
            return Err(self
                .abandon(content_id, path, fetch_error(content_id, reason))
                .await);
        }
        let archive_size = bytes.len() as u64;
        drop(bytes);

        self.set_state(content_id, path, AssetState::Extracting);
        let (checksum, format) = match self.unpack(&staging, path, claim.share()).await {
            Ok(unpacked) => unpacked,
            Err(source) => {
                let error = CacheError::Extract {
                    content_id: content_id.to_string(),
                    source,
                };
                return Err(self.abandon(content_id, path, error).await);
            }
        };
        if let Err(error) = tokio::fs::remove_file(&staging).await {
            warn!(content_id, "failed to remove downloaded archive: {error}");
        }
        self.update(content_id, path, |asset| {
            asset.archive_size_bytes = archive_size;
            asset.archive_checksum = Some(checksum.clone());
        });
        debug!(
            content_id,
            format = format.extension(),
            archive_size,
            checksum = %checksum,
            "model archive extracted"
        );

        self.set_state(content_id, path, AssetState::Validating);
        let missing = self.missing_files(path).await;
        if !missing.is_empty() {
            self.set_state(content_id, path, AssetState::Invalid);
            warn!(content_id, ?missing, "extracted model failed validation");
            return Err(CacheError::Validation {
                content_id: content_id.to_string(),
                missing: missing.into_iter().map(str::to_string).collect(),
            });
        }

        self.set_state(content_id, path, AssetState::Ready);
        info!(content_id, path = ?path, "model ready");
        Ok(())
    }

    async fn unpack(
        &self,
        staging: &Path,
        destination: &Path,
        guard: Option<EntryGuard>,
    ) -> Result<(String, ArchiveFormat), ExtractError> {
        let archive = staging.to_path_buf();
        let target = destination.to_path_buf();
        let strip_components = self.options.strip_components;
        // outlives a cancelled resolve; the entry stays locked until this returns
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let checksum =
                compute_sha256(&archive).map_err(|err| ExtractError::io(&archive, err))?;
            let format = extract_with(&archive, &target, strip_components)?;
            Ok((checksum, format))
        });
        match task.await {
            Ok(result) => result,
            Err(join) => Err(ExtractError::io(
                destination,
                io::Error::new(io::ErrorKind::Other, join.to_string()),
            )),
        }
    }

    /// Removes the partially built entry so a retry starts clean, then hands
    /// back `error`.
    async fn abandon(&self, content_id: &str, path: &Path, error: CacheError) -> CacheError {
        warn!(content_id, "model resolution failed: {error}");
        if let Err(cleanup) = remove_entry_dir(path).await {
            warn!(content_id, path = ?path, "failed to clean up partial cache entry: {cleanup}");
        }
        self.set_state(content_id, path, AssetState::Missing);
        error
    }

    async fn is_valid(&self, path: &Path) -> bool {
        self.missing_files(path).await.is_empty()
    }

    async fn missing_files(&self, path: &Path) -> Vec<&'static str> {
        let layout = self.options.layout;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || layout.missing_files(&path))
            .await
            .unwrap_or_else(|_| layout.required_files.to_vec())
    }

    async fn claim(&self, content_id: &str) -> EntryClaim<'_> {
        let lock = self.entry_lock(content_id);
        let guard = Arc::clone(&lock).lock_owned().await;
        EntryClaim {
            cache: self,
            content_id: content_id.to_string(),
            lock,
            guard: Some(Arc::new(guard)),
        }
    }

    fn try_claim(&self, content_id: &str) -> Option<EntryClaim<'_>> {
        let lock = self.entry_lock(content_id);
        let guard = Arc::clone(&lock).try_lock_owned().ok().map(Arc::new);
        let claim = EntryClaim {
            cache: self,
            content_id: content_id.to_string(),
            lock,
            guard,
        };
        if claim.guard.is_some() {
            Some(claim)
        } else {
            None
        }
    }

    fn entry_lock(&self, content_id: &str) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock();
        Arc::clone(
            inflight
                .entry(content_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn set_state(&self, content_id: &str, path: &Path, state: AssetState) {
        self.update(content_id, path, |asset| asset.state = state);
        debug!(content_id, ?state, "asset state changed");
    }

    fn mark_ready_if_unknown(&self, content_id: &str, path: &Path) {
        let mut assets = self.assets.lock();
        let asset = assets
            .entry(content_id.to_string())
            .or_insert_with(|| ModelAsset::new(content_id, path, AssetState::Ready));
        if asset.state != AssetState::Ready {
            asset.state = AssetState::Ready;
            asset.updated_at = OffsetDateTime::now_utc();
        }
    }

    fn update<F>(&self, content_id: &str, path: &Path, apply: F)
    where
        F: FnOnce(&mut ModelAsset),
    {
        let mut assets = self.assets.lock();
        let asset = assets
            .entry(content_id.to_string())
            .or_insert_with(|| ModelAsset::new(content_id, path, AssetState::Missing));
        apply(asset);
        asset.updated_at = OffsetDateTime::now_utc();
    }
}

fn fetch_error(content_id: &str, reason: impl ToString) -> CacheError {
    CacheError::Fetch {
        content_id: content_id.to_string(),
        reason: reason.to_string(),
    }
}

async fn try_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_entry_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Whether `path` is still a directory last modified before `cutoff`.
async fn expired(path: &Path, cutoff: SystemTime) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => metadata
            .modified()
            .map(|modified| modified < cutoff)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use bytes::Bytes;
    use zip::write::{FileOptions, ZipWriter};

    use super::*;
    use crate::storage::MemoryContentStore;

    fn model_zip(files: &[&str]) -> Bytes {
        let mut writer = ZipWriter::new(io::Cursor::new(Vec::new()));
        for name in files {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(name.as_bytes()).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    fn complete_model() -> Bytes {
        model_zip(&["pytorch_lora_weights.safetensors", "config.json"])
    }

    fn cache_with(store: &Arc<MemoryContentStore>) -> (tempfile::TempDir, AssetCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::new(dir.path().join("models"), store.clone());
        (dir, cache)
    }

    #[tokio::test]
    async fn second_resolve_is_a_cache_hit() {
        let store = Arc::new(MemoryContentStore::new());
        let cid = store.insert(complete_model());
        let (_dir, cache) = cache_with(&store);

        let first = cache.resolve(&cid).await.unwrap();
        let second = cache.resolve(&cid).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, cache.root().join(&cid));
        assert_eq!(store.fetch_count(), 1);
        assert!(!first.join(ARCHIVE_STAGING_NAME).exists());

        let asset = cache.asset(&cid).unwrap();
        assert_eq!(asset.state, AssetState::Ready);
        assert!(asset.archive_checksum.is_some());
        assert!(asset.archive_size_bytes > 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_directory() {
        let store = Arc::new(MemoryContentStore::new());
        let cid = store.insert(complete_model());
        store.fail_fetches_of(&cid);
        let (_dir, cache) = cache_with(&store);

        let err = cache.resolve(&cid).await.unwrap_err();

        assert!(matches!(err, CacheError::Fetch { .. }), "{err:?}");
        assert!(err.is_retryable());
        assert!(!cache.entry_path(&cid).exists());
        assert_eq!(cache.asset(&cid).unwrap().state, AssetState::Missing);
    }

    #[tokio::test]
    async fn fetch_timeout_is_a_fetch_error() {
        let store = Arc::new(MemoryContentStore::new().with_fetch_delay(Duration::from_secs(5)));
        let cid = store.insert(complete_model());
        let dir = tempfile::tempdir().unwrap();
        let options = AssetCacheOptions {
            fetch_timeout: Duration::from_millis(50),
            ..AssetCacheOptions::default()
        };
        let cache = AssetCache::with_options(dir.path(), store.clone(), options);

        let err = cache.resolve(&cid).await.unwrap_err();

        assert!(matches!(err, CacheError::Fetch { .. }), "{err:?}");
        assert!(!cache.entry_path(&cid).exists());
    }

    #[tokio::test]
    async fn corrupt_archive_is_cleaned_up() {
        let store = Arc::new(MemoryContentStore::new());
        let cid = store.insert(Bytes::from_static(b"definitely not an archive"));
        let (_dir, cache) = cache_with(&store);

        let err = cache.resolve(&cid).await.unwrap_err();

        assert!(
            matches!(
                err,
                CacheError::Extract {
                    source: ExtractError::CorruptArchive { .. },
                    ..
                }
            ),
            "{err:?}"
        );
        assert!(!err.is_retryable());
        assert!(!cache.entry_path(&cid).exists());
    }

    #[tokio::test]
    async fn incomplete_model_is_left_invalid_and_refetched_later() {
        let store = Arc::new(MemoryContentStore::new());
        let cid = store.insert(model_zip(&["config.json"]));
        let (_dir, cache) = cache_with(&store);

        let err = cache.resolve(&cid).await.unwrap_err();
        match err {
            CacheError::Validation { missing, .. } => {
                assert_eq!(missing, vec!["pytorch_lora_weights.safetensors".to_string()])
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(cache.entry_path(&cid).join("config.json").exists());
        assert_eq!(cache.asset(&cid).unwrap().state, AssetState::Invalid);

        // a leftover invalid directory is never treated as a hit
        assert!(cache.resolve(&cid).await.is_err());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn partial_directory_is_not_a_cache_hit() {
        let store = Arc::new(MemoryContentStore::new());
        let cid = store.insert(complete_model());
        let (_dir, cache) = cache_with(&store);
        let path = cache.entry_path(&cid);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("config.json"), b"half").unwrap();
        fs::write(path.join(ARCHIVE_STAGING_NAME), b"PK").unwrap();

        let resolved = cache.resolve(&cid).await.unwrap();

        assert_eq!(store.fetch_count(), 1);
        assert_eq!(fs::read(resolved.join("config.json")).unwrap(), b"config.json");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_share_one_fetch() {
        let store =
            Arc::new(MemoryContentStore::new().with_fetch_delay(Duration::from_millis(100)));
        let cid = store.insert(complete_model());
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AssetCache::new(dir.path(), store.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let cid = cid.clone();
                tokio::spawn(async move { cache.resolve(&cid).await })
            })
            .collect();

        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await.unwrap().unwrap());
        }

        assert_eq!(store.fetch_count(), 1);
        assert!(paths.iter().all(|path| path == &paths[0]));
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn shared_guard_keeps_the_entry_locked() {
        let store = Arc::new(MemoryContentStore::new());
        let (_dir, cache) = cache_with(&store);

        let claim = cache.claim("model").await;
        let shared = claim.share();
        drop(claim);
        assert!(cache.try_claim("model").is_none());

        drop(shared);
        assert!(cache.try_claim("model").is_some());
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_resolve_does_not_race_its_retry() {
        let mut files: Vec<String> = (0..2000).map(|i| format!("shards/{i}.bin")).collect();
        files.push("pytorch_lora_weights.safetensors".into());
        files.push("config.json".into());
        let names: Vec<&str> = files.iter().map(String::as_str).collect();
        let store = Arc::new(MemoryContentStore::new());
        let cid = store.insert(model_zip(&names));
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::new(dir.path(), store.clone());

        for millis in [1, 5, 20, 50] {
            cache.evict(&cid).await.unwrap();
            let abandoned =
                tokio::time::timeout(Duration::from_millis(millis), cache.resolve(&cid)).await;
            assert!(abandoned.map(|resolved| resolved.is_ok()).unwrap_or(true));

            let path = cache.resolve(&cid).await.unwrap();
            assert_eq!(fs::read(path.join("config.json")).unwrap(), b"config.json");
            assert_eq!(fs::read(path.join("shards/1999.bin")).unwrap(), b"shards/1999.bin");
            assert!(!path.join(ARCHIVE_STAGING_NAME).exists());
            assert_eq!(cache.asset(&cid).unwrap().state, AssetState::Ready);
        }
    }

    #[tokio::test]
    async fn rejects_ids_that_are_not_plain_names() {
        let store = Arc::new(MemoryContentStore::new());
        let (_dir, cache) = cache_with(&store);
        for bad in ["", "../etc", "a/b", "Qm..", "bafk 1"] {
            assert!(matches!(
                cache.resolve(bad).await,
                Err(CacheError::InvalidContentId(_))
            ));
        }
        assert_eq!(store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_old_entries() {
        let store = Arc::new(MemoryContentStore::new());
        let (_dir, cache) = cache_with(&store);
        fs::create_dir_all(cache.entry_path("old")).unwrap();
        fs::write(cache.root().join("notes.txt"), b"not an entry").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let cutoff = SystemTime::now();
        tokio::time::sleep(Duration::from_millis(30)).await;
        fs::create_dir_all(cache.entry_path("fresh")).unwrap();

        let removed = cache.sweep_before(cutoff).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!cache.entry_path("old").exists());
        assert!(cache.entry_path("fresh").exists());
        assert!(cache.root().join("notes.txt").exists());

        // a generous max age keeps everything
        assert_eq!(cache.sweep(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(cache.entry_path("fresh").exists());
    }

    #[tokio::test]
    async fn sweep_skips_entries_being_resolved() {
        let store = Arc::new(MemoryContentStore::new());
        let (_dir, cache) = cache_with(&store);
        fs::create_dir_all(cache.entry_path("busy")).unwrap();
        fs::create_dir_all(cache.entry_path("idle")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let held = cache.claim("busy").await;
        let removed = cache.sweep(Duration::ZERO).await.unwrap();
        drop(held);

        assert_eq!(removed, 1);
        assert!(cache.entry_path("busy").exists());
        assert!(!cache.entry_path("idle").exists());
    }

    #[tokio::test]
    async fn refreshed_entry_is_no_longer_expired() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("entry");
        fs::create_dir_all(&entry).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let cutoff = SystemTime::now();
        assert!(expired(&entry, cutoff).await);

        // rebuilt by a resolve after the sweep first looked at it
        fs::remove_dir_all(&entry).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        fs::create_dir_all(&entry).unwrap();
        assert!(!expired(&entry, cutoff).await);

        fs::remove_dir_all(&entry).unwrap();
        assert!(!expired(&entry, cutoff).await);
        fs::write(&entry, b"file").unwrap();
        assert!(!expired(&entry, SystemTime::now() + Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn sweep_of_missing_root_is_empty() {
        let store = Arc::new(MemoryContentStore::new());
        let (_dir, cache) = cache_with(&store);
        assert_eq!(cache.sweep(Duration::ZERO).await.unwrap(), 0);
        assert!(cache.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn evict_and_scan() {
        let store = Arc::new(MemoryContentStore::new());
        let cid = store.insert(complete_model());
        let (_dir, cache) = cache_with(&store);
        cache.resolve(&cid).await.unwrap();
        fs::create_dir_all(cache.entry_path("leftover")).unwrap();

        let scanned = cache.scan().await.unwrap();
        assert_eq!(scanned.len(), 2);
        let states: HashMap<_, _> = scanned
            .iter()
            .map(|asset| (asset.content_id.as_str(), asset.state))
            .collect();
        assert_eq!(states[cid.as_str()], AssetState::Ready);
        assert_eq!(states["leftover"], AssetState::Invalid);

        assert!(cache.evict(&cid).await.unwrap());
        assert!(!cache.evict(&cid).await.unwrap());
        assert!(cache.asset(&cid).is_none());
        assert!(!cache.entry_path(&cid).exists());
    }
}
