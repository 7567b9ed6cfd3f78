//! S3 provider client
//!
//! The provider `host` names a bucket in the object store. Paths map to key
//! prefixes; listing returns the objects one level below the prefix.

use super::{normalize_dir, ByteStream, ProtocolClient, ProtocolContext};
use crate::error::{IngestError, Result};
use crate::models::{DiscoveredFile, Provider};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct S3Client {
    bucket: String,
    list_path: Option<String>,
    store: Arc<dyn ObjectStore>,
    connected: bool,
}

/// Key prefix for a directory path: no leading slash, one trailing slash
fn dir_prefix(path: &str) -> String {
    let dir = normalize_dir(path);
    let dir = dir.trim_start_matches('/');
    if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    }
}

impl S3Client {
    pub fn new(provider: &Provider, ctx: &ProtocolContext) -> Self {
        Self {
            bucket: provider.host.clone(),
            list_path: provider.list_path.clone(),
            store: Arc::clone(&ctx.object_store),
            connected: false,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(IngestError::Connection(format!(
                "S3 provider bucket {} is not connected",
                self.bucket
            )))
        }
    }
}

#[async_trait]
impl ProtocolClient for S3Client {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DiscoveredFile>> {
        self.ensure_connected()?;
        let dir = normalize_dir(path);
        let prefix = dir_prefix(self.list_path.as_deref().unwrap_or(&dir));

        let objects = self
            .store
            .list_prefix(&self.bucket, &prefix)
            .await
            .map_err(|e| IngestError::RemoteResource(format!("S3 list {}/{}: {}", self.bucket, prefix, e)))?;

        let files: Vec<DiscoveredFile> = objects
            .into_iter()
            .filter_map(|obj| {
                let name = obj.key.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                Some(DiscoveredFile::new(name, dir.clone()).with_size(obj.size))
            })
            .collect();

        debug!("Listed s3://{}/{} ({} files)", self.bucket, prefix, files.len());
        Ok(files)
    }

    async fn fetch(&mut self, remote_path: &str) -> Result<ByteStream> {
        self.ensure_connected()?;
        let key = remote_path.trim_start_matches('/');
        self.store
            .get_stream(&self.bucket, key)
            .await
            .map_err(|e| IngestError::RemoteResource(format!("S3 fetch {}/{}: {}", self.bucket, key, e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}
