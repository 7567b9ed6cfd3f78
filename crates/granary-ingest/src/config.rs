//! Ingest configuration
//!
//! Loaded from environment variables (after `.env`), with defaults suitable for
//! a local MinIO/LocalStack stack.

use crate::models::Buckets;
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_STACK: &str = "granary";
const DEFAULT_INTERNAL_BUCKET: &str = "granary-internal";
const DEFAULT_STAGING_PREFIX: &str = "file-staging";
const DEFAULT_CONCURRENCY: usize = 3;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Retry policy of the resource lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockConfig {
    /// Create attempts before giving up (default: 30)
    pub max_attempts: u32,
    /// Sleep between attempts in milliseconds (default: 2000)
    pub backoff_ms: u64,
    /// Age after which an existing lease is considered abandoned (default: 15 min)
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            backoff_ms: 2000,
            stale_after_secs: 15 * 60,
        }
    }
}

impl LockConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("LOCK_MAX_ATTEMPTS", defaults.max_attempts),
            backoff_ms: env_or("LOCK_BACKOFF_MS", defaults.backoff_ms),
            stale_after_secs: env_or("LOCK_STALE_AFTER_SECS", defaults.stale_after_secs),
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Metadata catalog (CMR) connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CmrConfig {
    /// Base URL, e.g. `https://cmr.uat.earthdata.nasa.gov`
    pub endpoint: Option<String>,
    /// CMR provider id granules are ingested under
    pub provider: String,
    pub client_id: String,
    pub token: Option<String>,
}

impl CmrConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("CMR_ENDPOINT").ok(),
            provider: std::env::var("CMR_PROVIDER").unwrap_or_default(),
            client_id: std::env::var("CMR_CLIENT_ID").unwrap_or_else(|_| DEFAULT_STACK.to_string()),
            token: std::env::var("CMR_TOKEN").ok(),
        }
    }
}

/// Main ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Deployment name; prefixes internal keys (collections, PDR archive, crypto)
    pub stack: String,
    /// Bucket holding stack-internal objects
    pub internal_bucket: String,
    /// Key prefix staged files land under
    pub staging_prefix: String,
    /// Granules processed in parallel by batch operations
    pub concurrency: usize,
    /// Protocol connect/list timeout in seconds
    pub connect_timeout_secs: u64,
    /// Base URL protected files are distributed from
    pub distribution_endpoint: String,
    /// Queue used when a message template names none
    pub default_queue_url: Option<String>,
    pub buckets: Buckets,
    pub storage: StorageConfig,
    pub lock: LockConfig,
    pub cmr: CmrConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stack: DEFAULT_STACK.to_string(),
            internal_bucket: DEFAULT_INTERNAL_BUCKET.to_string(),
            staging_prefix: DEFAULT_STAGING_PREFIX.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            distribution_endpoint: String::new(),
            default_queue_url: None,
            buckets: Buckets::default(),
            storage: StorageConfig::default(),
            lock: LockConfig::default(),
            cmr: CmrConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load ingest configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let buckets = match std::env::var("INGEST_BUCKETS") {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("INGEST_BUCKETS is not a valid bucket map: {}", e))?,
            Err(_) => Buckets::default(),
        };

        let config = Self {
            stack: std::env::var("INGEST_STACK").unwrap_or_else(|_| DEFAULT_STACK.to_string()),
            internal_bucket: std::env::var("INGEST_INTERNAL_BUCKET")
                .unwrap_or_else(|_| DEFAULT_INTERNAL_BUCKET.to_string()),
            staging_prefix: std::env::var("INGEST_STAGING_PREFIX")
                .unwrap_or_else(|_| DEFAULT_STAGING_PREFIX.to_string()),
            concurrency: env_or("INGEST_CONCURRENCY", DEFAULT_CONCURRENCY),
            connect_timeout_secs: env_or("INGEST_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            distribution_endpoint: std::env::var("INGEST_DISTRIBUTION_ENDPOINT").unwrap_or_default(),
            default_queue_url: std::env::var("INGEST_QUEUE_URL").ok(),
            buckets,
            storage: StorageConfig::from_env()?,
            lock: LockConfig::from_env(),
            cmr: CmrConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stack.is_empty() {
            anyhow::bail!("INGEST_STACK must not be empty");
        }
        if self.internal_bucket.is_empty() {
            anyhow::bail!("INGEST_INTERNAL_BUCKET must not be empty");
        }
        if self.concurrency == 0 {
            anyhow::bail!("INGEST_CONCURRENCY must be greater than 0");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("INGEST_CONNECT_TIMEOUT_SECS must be greater than 0");
        }
        if self.lock.max_attempts == 0 {
            anyhow::bail!("LOCK_MAX_ATTEMPTS must be greater than 0");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Key prefix files of one collection are staged under
    pub fn staging_dir(&self, data_type: &str, version: &str) -> String {
        format!("{}/{}___{}", self.staging_prefix.trim_end_matches('/'), data_type, version)
    }
}
