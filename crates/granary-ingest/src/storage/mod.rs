//! Object store abstraction
//!
//! Staging, archive, lease and collection records all live in buckets behind
//! [`ObjectStore`]. [`S3ObjectStore`] talks to S3-compatible services;
//! [`InMemoryObjectStore`] backs tests and dry runs.

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{BucketVersioningStatus, VersioningConfiguration},
    Client,
};
use chrono::{DateTime, Utc};
use granary_common::types::S3Location;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};

pub mod config;
pub mod memory;

pub use config::StorageConfig;
pub use memory::InMemoryObjectStore;

/// Sequential reader over an object body
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Metadata of an object, `None` when absent
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>>;

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;

    /// Create the object only if no object exists at the key.
    /// Returns `false` when the key is already taken.
    async fn put_if_absent(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<bool>;

    /// Upload a local file, returning its size
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<ObjectReader>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    async fn copy(&self, source: &S3Location, target: &S3Location) -> Result<()>;

    /// All objects whose key starts with `prefix`, sorted by key
    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMetadata>>;

    async fn enable_versioning(&self, bucket: &str) -> Result<()>;
}

/// [`ObjectStore`] over an S3-compatible service
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig) -> Self {
        debug!("Initializing object store with config: {:?}", config.endpoint);

        let sdk_config = config.sdk_config().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        info!(region = %config.region, "Object store client initialized");

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn storage_err(action: &str, bucket: &str, key: &str, e: impl std::fmt::Display) -> IngestError {
    IngestError::Storage(format!("Failed to {} s3://{}/{}: {}", action, bucket, key, e))
}

/// `CopySource` value: bucket plus the key percent-encoded per path segment
fn copy_source(location: &S3Location) -> String {
    let key = location
        .key
        .split('/')
        .map(|segment| url::form_urlencoded::byte_serialize(segment.as_bytes()).collect::<String>().replace('+', "%20"))
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", location.bucket, key)
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.head(bucket, key).await?.is_some())
    }

    #[instrument(skip(self))]
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(response) => Ok(Some(ObjectMetadata {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0).max(0) as u64,
                last_modified: response.last_modified().and_then(to_chrono),
            })),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Ok(None)
                } else {
                    Err(storage_err("head", bucket, key, e))
                }
            },
        }
    }

    #[instrument(skip(self, data))]
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        debug!("Uploading {} bytes to s3://{}/{}", data.len(), bucket, key);

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| storage_err("upload", bucket, key, e))?;

        Ok(())
    }

    #[instrument(skip(self, data))]
    async fn put_if_absent(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(data))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let status = e.raw_response().map(|r| r.status().as_u16());
                // 412 when the key exists, 409 when a concurrent conditional write won
                if matches!(status, Some(412) | Some(409)) {
                    Ok(false)
                } else {
                    Err(storage_err("conditionally upload", bucket, key, e))
                }
            },
        }
    }

    #[instrument(skip(self))]
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| storage_err("read local file for", bucket, key, e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| storage_err("upload", bucket, key, e))?;

        info!("Uploaded {} bytes to s3://{}/{}", size, bucket, key);
        Ok(size)
    }

    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("download", bucket, key, e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| storage_err("read body of", bucket, key, e))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), bucket, key);
        Ok(data)
    }

    #[instrument(skip(self))]
    async fn get_stream(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("open stream for", bucket, key, e))?;

        Ok(Box::pin(response.body.into_async_read()))
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("delete", bucket, key, e))?;

        debug!("Deleted s3://{}/{}", bucket, key);
        Ok(())
    }

    #[instrument(skip(self), fields(source = %source, target = %target))]
    async fn copy(&self, source: &S3Location, target: &S3Location) -> Result<()> {
        let copy_source = copy_source(source);

        self.client
            .copy_object()
            .bucket(&target.bucket)
            .key(&target.key)
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(|e| storage_err("copy to", &target.bucket, &target.key, e))?;

        info!("Copied {} to {}", source, target);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| storage_err("list", bucket, prefix, e))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectMetadata {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj.last_modified().and_then(to_chrono),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        self.client
            .put_bucket_versioning()
            .bucket(bucket)
            .versioning_configuration(
                VersioningConfiguration::builder()
                    .status(BucketVersioningStatus::Enabled)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_err("enable versioning on", bucket, "", e))?;

        info!(bucket, "Enabled bucket versioning");
        Ok(())
    }
}
