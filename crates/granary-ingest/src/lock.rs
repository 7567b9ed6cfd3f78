//! Per-granule resource lock
//!
//! Two ingests of the same (provider, granule id) must never overlap. A lease
//! record is created with a create-if-absent write. Contenders retry with a
//! fixed backoff, and leases older than `stale_after` are treated as
//! abandoned: the exact stale record is removed and the create retried at once.

use crate::config::LockConfig;
use crate::error::{IngestError, Result};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub provider: String,
    pub granule_id: String,
    pub acquired_at: DateTime<Utc>,
    pub owner: String,
}

impl Lease {
    pub fn key(&self) -> String {
        lease_key(&self.provider, &self.granule_id)
    }
}

pub fn lease_key(provider: &str, granule_id: &str) -> String {
    format!("{}/{}", provider, granule_id)
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Store the lease unless one already exists; `false` on conflict
    async fn create(&self, lease: &Lease) -> Result<bool>;

    async fn get(&self, provider: &str, granule_id: &str) -> Result<Option<Lease>>;

    async fn delete(&self, provider: &str, granule_id: &str) -> Result<()>;

    /// Delete the stored lease only if it is still `expected`; `false` otherwise
    async fn delete_if_matches(&self, expected: &Lease) -> Result<bool>;
}

/// Leases kept as JSON objects under `{stack}/locks/` via conditional put
pub struct ObjectStoreLeases {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ObjectStoreLeases {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, stack: &str) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: format!("{}/locks", stack),
        }
    }

    fn object_key(&self, provider: &str, granule_id: &str) -> String {
        format!("{}/{}", self.prefix, lease_key(provider, granule_id))
    }
}

#[async_trait]
impl LeaseStore for ObjectStoreLeases {
    async fn create(&self, lease: &Lease) -> Result<bool> {
        let key = self.object_key(&lease.provider, &lease.granule_id);
        self.store
            .put_if_absent(&self.bucket, &key, serde_json::to_vec(lease)?)
            .await
    }

    async fn get(&self, provider: &str, granule_id: &str) -> Result<Option<Lease>> {
        let key = self.object_key(provider, granule_id);
        if !self.store.exists(&self.bucket, &key).await? {
            return Ok(None);
        }
        match self.store.get(&self.bucket, &key).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) => {
                if self.store.exists(&self.bucket, &key).await? {
                    return Err(e);
                }
                // Released between the existence check and the read
                debug!(key = %key, error = %e, "Lease vanished before read");
                Ok(None)
            },
        }
    }

    async fn delete(&self, provider: &str, granule_id: &str) -> Result<()> {
        self.store
            .delete(&self.bucket, &self.object_key(provider, granule_id))
            .await
    }

    /// Compare-then-delete; the object store has no conditional delete
    async fn delete_if_matches(&self, expected: &Lease) -> Result<bool> {
        match self.get(&expected.provider, &expected.granule_id).await? {
            Some(current) if current == *expected => {
                self.delete(&expected.provider, &expected.granule_id).await?;
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryLeases {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>> {
        self.leases
            .lock()
            .map_err(|_| IngestError::Storage("lease map lock poisoned".to_string()))
    }

    /// Number of leases currently held
    pub fn len(&self) -> usize {
        self.leases().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeases {
    async fn create(&self, lease: &Lease) -> Result<bool> {
        let mut leases = self.leases()?;
        if leases.contains_key(&lease.key()) {
            return Ok(false);
        }
        leases.insert(lease.key(), lease.clone());
        Ok(true)
    }

    async fn get(&self, provider: &str, granule_id: &str) -> Result<Option<Lease>> {
        Ok(self.leases()?.get(&lease_key(provider, granule_id)).cloned())
    }

    async fn delete(&self, provider: &str, granule_id: &str) -> Result<()> {
        self.leases()?.remove(&lease_key(provider, granule_id));
        Ok(())
    }

    async fn delete_if_matches(&self, expected: &Lease) -> Result<bool> {
        let mut leases = self.leases()?;
        if leases.get(&expected.key()) != Some(expected) {
            return Ok(false);
        }
        leases.remove(&expected.key());
        Ok(true)
    }
}

pub struct ResourceLock {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    owner: String,
}

impl ResourceLock {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            owner: Uuid::new_v4().to_string(),
        }
    }

    fn lease(&self, provider: &str, granule_id: &str) -> Lease {
        Lease {
            provider: provider.to_string(),
            granule_id: granule_id.to_string(),
            acquired_at: Utc::now(),
            owner: self.owner.clone(),
        }
    }

    /// Try to take the lease, retrying per the configured policy.
    /// Returns `false` once attempts are exhausted.
    pub async fn acquire(&self, provider: &str, granule_id: &str) -> Result<bool> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .unwrap_or(chrono::Duration::MAX);

        for attempt in 1..=self.config.max_attempts {
            if self.store.create(&self.lease(provider, granule_id)).await? {
                debug!(provider, granule_id, attempt, "Lock acquired");
                return Ok(true);
            }

            let free = match self.store.get(provider, granule_id).await? {
                Some(existing) if Utc::now().signed_duration_since(existing.acquired_at) > stale_after => {
                    warn!(
                        provider,
                        granule_id,
                        owner = %existing.owner,
                        acquired_at = %existing.acquired_at,
                        "Removing stale lease"
                    );
                    self.store.delete_if_matches(&existing).await?;
                    true
                },
                // Released between our create and get
                None => true,
                Some(_) => false,
            };

            if free && self.store.create(&self.lease(provider, granule_id)).await? {
                debug!(provider, granule_id, attempt, "Lock acquired after the previous lease went away");
                return Ok(true);
            }

            if attempt < self.config.max_attempts {
                debug!(provider, granule_id, attempt, "Lock busy, retrying in {:?}", self.config.backoff());
                tokio::time::sleep(self.config.backoff()).await;
            }
        }

        info!(provider, granule_id, attempts = self.config.max_attempts, "Lock not acquired");
        Ok(false)
    }

    /// Drop the lease regardless of owner
    pub async fn release(&self, provider: &str, granule_id: &str) -> Result<()> {
        self.store.delete(provider, granule_id).await?;
        debug!(provider, granule_id, "Lock released");
        Ok(())
    }

    /// Acquire and wrap the lease in a guard that releases it when dropped
    pub async fn guard(&self, provider: &str, granule_id: &str) -> Result<LockGuard> {
        if !self.acquire(provider, granule_id).await? {
            return Err(IngestError::ResourcesLocked {
                provider: provider.to_string(),
                granule_id: granule_id.to_string(),
            });
        }
        Ok(LockGuard {
            store: Arc::clone(&self.store),
            provider: provider.to_string(),
            granule_id: granule_id.to_string(),
            released: false,
        })
    }
}

/// Held lease; released by [`LockGuard::release`] or, failing that, on drop
pub struct LockGuard {
    store: Arc<dyn LeaseStore>,
    provider: String,
    granule_id: String,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.delete(&self.provider, &self.granule_id).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let provider = std::mem::take(&mut self.provider);
        let granule_id = std::mem::take(&mut self.granule_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.delete(&provider, &granule_id).await {
                        warn!(provider = %provider, granule_id = %granule_id, error = %e, "Failed to release lease");
                    }
                });
            },
            Err(_) => {
                warn!(provider = %provider, granule_id = %granule_id, "No runtime to release lease; it will expire as stale");
            },
        }
    }
}
