use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use super::{database::split_path, ContentStore, Database};
use crate::error::{DatabaseError, StoreError};
use crate::models::sha256_hex;

/// In-process JSON tree with realtime-database semantics: writing `null`
/// deletes, and objects left empty disappear.
#[derive(Debug)]
pub struct MemoryDatabase {
    root: RwLock<Value>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self {
            root: RwLock::new(Value::Object(Map::new())),
        }
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Value {
        self.root.read().clone()
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn get_at<'a>(node: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(node, |current, segment| current.as_object()?.get(*segment))
}

fn set_at(node: &mut Value, segments: &[&str], value: Value) {
    match segments.split_first() {
        None => *node = value,
        Some((first, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(first.to_string()).or_insert(Value::Null);
                set_at(child, rest, value);
            }
        }
    }
}

fn remove_at(node: &mut Value, segments: &[&str]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(*first);
        return;
    }
    if let Some(child) = map.get_mut(*first) {
        remove_at(child, rest);
        if is_empty_value(child) {
            map.remove(*first);
        }
    }
}

impl MemoryDatabase {
    fn write(&self, segments: &[&str], value: Value) {
        let mut root = self.root.write();
        if is_empty_value(&value) {
            remove_at(&mut root, segments);
        } else {
            set_at(&mut root, segments, value);
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get(&self, path: &str) -> Result<Option<Value>, DatabaseError> {
        let segments = split_path(path)?;
        let root = self.root.read();
        Ok(get_at(&root, &segments)
            .filter(|value| !is_empty_value(value))
            .cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), DatabaseError> {
        let segments = split_path(path)?;
        self.write(&segments, value);
        Ok(())
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), DatabaseError> {
        let Value::Object(children) = partial else {
            return Err(DatabaseError::Shape {
                path: path.to_string(),
                reason: "update expects an object".into(),
            });
        };
        for (key, value) in children {
            let child_path = format!("{}/{}", path.trim_end_matches('/'), key);
            let segments = split_path(&child_path)?;
            self.write(&segments, value);
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), DatabaseError> {
        let segments = split_path(path)?;
        remove_at(&mut self.root.write(), &segments);
        Ok(())
    }
}

/// Content store kept in memory. Ids are derived from the SHA-256 of the
/// content, so identical bytes share an id.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<String, Bytes>>,
    pinned: Mutex<Vec<(String, String)>>,
    failing: RwLock<HashSet<String>>,
    fetches: AtomicUsize,
    fetch_delay: Option<Duration>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch, so concurrent callers overlap.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn content_id_for(bytes: &[u8]) -> String {
        format!("bafk{}", sha256_hex(bytes))
    }

    /// Store content without counting it as a pin.
    pub fn insert(&self, bytes: impl Into<Bytes>) -> String {
        let bytes = bytes.into();
        let content_id = Self::content_id_for(&bytes);
        self.objects.write().insert(content_id.clone(), bytes);
        content_id
    }

    /// Make every fetch of `content_id` fail with a server error.
    pub fn fail_fetches_of(&self, content_id: &str) {
        self.failing.write().insert(content_id.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// `(content id, name)` of every pin, in order.
    pub fn pins(&self) -> Vec<(String, String)> {
        self.pinned.lock().clone()
    }

    pub fn contains(&self, content_id: &str) -> bool {
        self.objects.read().contains_key(content_id)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn pin(&self, bytes: Bytes, name: &str) -> Result<String, StoreError> {
        let content_id = self.insert(bytes);
        self.pinned.lock().push((content_id.clone(), name.to_string()));
        Ok(content_id)
    }

    async fn fetch(&self, content_id: &str) -> Result<Bytes, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.read().contains(content_id) {
            return Err(StoreError::Status {
                url: self.gateway_url(content_id),
                status: 503,
            });
        }
        self.objects
            .read()
            .get(content_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(content_id.to_string()))
    }

    fn gateway_url(&self, content_id: &str) -> String {
        format!("memory://ipfs/{content_id}")
    }
}
