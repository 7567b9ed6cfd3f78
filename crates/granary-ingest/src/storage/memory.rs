//! In-memory [`ObjectStore`]

use super::{ObjectMetadata, ObjectReader, ObjectStore};
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use granary_common::types::S3Location;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    versioned: HashSet<String>,
    /// Overwritten bodies kept while versioning is enabled
    history: HashMap<(String, String), Vec<Vec<u8>>>,
}

/// Object store held in process memory
#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Mutex<State>,
    fail_deletes: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| IngestError::Storage("in-memory store lock poisoned".to_string()))
    }

    /// Make every subsequent delete fail, for residue tests
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn is_versioning_enabled(&self, bucket: &str) -> bool {
        self.state()
            .map(|s| s.versioned.contains(bucket))
            .unwrap_or(false)
    }

    /// Prior versions retained for a key
    pub fn previous_versions(&self, bucket: &str, key: &str) -> usize {
        self.state()
            .map(|s| {
                s.history
                    .get(&(bucket.to_string(), key.to_string()))
                    .map_or(0, Vec::len)
            })
            .unwrap_or(0)
    }

    /// Every key in a bucket
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .map(|s| {
                s.buckets
                    .get(bucket)
                    .map(|objects| objects.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn insert(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.state()?;
        let versioned = state.versioned.contains(bucket);
        let previous = state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data,
                    last_modified: Utc::now(),
                },
            );

        if let (true, Some(previous)) = (versioned, previous) {
            state
                .history
                .entry((bucket.to_string(), key.to_string()))
                .or_default()
                .push(previous.data);
        }
        Ok(())
    }

    fn fetch(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        self.state()?
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| IngestError::Storage(format!("NoSuchKey: s3://{}/{}", bucket, key)))
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.head(bucket, key).await?.is_some())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self
            .state()?
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|obj| ObjectMetadata {
                key: key.to_string(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
            }))
    }

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.insert(bucket, key, data)
    }

    async fn put_if_absent(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<bool> {
        let mut state = self.state()?;
        let objects = state.buckets.entry(bucket.to_string()).or_default();
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64> {
        let data = tokio::fs::read(path).await?;
        let size = data.len() as u64;
        self.insert(bucket, key, data)?;
        Ok(size)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        Ok(self.fetch(bucket, key)?.data)
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let data = self.fetch(bucket, key)?.data;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(IngestError::Storage(format!(
                "AccessDenied: delete s3://{}/{}",
                bucket, key
            )));
        }
        if let Some(objects) = self.state()?.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn copy(&self, source: &S3Location, target: &S3Location) -> Result<()> {
        let data = self.fetch(&source.bucket, &source.key)?.data;
        self.insert(&target.bucket, &target.key, data)
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        Ok(self
            .state()?
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, obj)| ObjectMetadata {
                        key: key.clone(),
                        size: obj.data.len() as u64,
                        last_modified: Some(obj.last_modified),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        self.state()?.versioned.insert(bucket.to_string());
        Ok(())
    }
}
