//! Collection configuration lookup keyed by (data type, version)

use crate::error::{IngestError, Result};
use crate::models::Collection;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Fails with `CollectionNotFound` when no record exists
    async fn get(&self, data_type: &str, version: &str) -> Result<Collection>;
}

fn not_found(data_type: &str, version: &str) -> IngestError {
    IngestError::CollectionNotFound {
        data_type: data_type.to_string(),
        version: version.to_string(),
    }
}

/// Collections stored as JSON at `{stack}/collections/{name}___{version}.json`
pub struct ObjectStoreCollections {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    stack: String,
}

impl ObjectStoreCollections {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            stack: stack.into(),
        }
    }

    fn key(&self, data_type: &str, version: &str) -> String {
        format!("{}/collections/{}___{}.json", self.stack, data_type, version)
    }

    /// Write a collection record after validating it
    pub async fn put(&self, collection: &Collection) -> Result<()> {
        collection.validate()?;
        let key = self.key(&collection.name, &collection.version);
        self.store
            .put(&self.bucket, &key, serde_json::to_vec_pretty(collection)?)
            .await
    }
}

#[async_trait]
impl CollectionStore for ObjectStoreCollections {
    async fn get(&self, data_type: &str, version: &str) -> Result<Collection> {
        let key = self.key(data_type, version);
        if !self.store.exists(&self.bucket, &key).await? {
            return Err(not_found(data_type, version));
        }

        debug!(bucket = %self.bucket, key = %key, "Loading collection");
        let body = self.store.get(&self.bucket, &key).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[derive(Default)]
pub struct InMemoryCollections {
    collections: RwLock<HashMap<(String, String), Collection>>,
}

impl InMemoryCollections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(collections: impl IntoIterator<Item = Collection>) -> Self {
        let store = Self::new();
        for collection in collections {
            store.insert(collection);
        }
        store
    }

    pub fn insert(&self, collection: Collection) {
        if let Ok(mut map) = self.collections.write() {
            map.insert((collection.name.clone(), collection.version.clone()), collection);
        }
    }
}

#[async_trait]
impl CollectionStore for InMemoryCollections {
    async fn get(&self, data_type: &str, version: &str) -> Result<Collection> {
        self.collections
            .read()
            .map_err(|_| IngestError::Storage("collection map lock poisoned".to_string()))?
            .get(&(data_type.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| not_found(data_type, version))
    }
}
