//! Granule ingest
//!
//! Files of a manifest are streamed from the provider into a local temp file
//! while hashed, verified against the expected checksum, and only then put
//! into the staging bucket. The first failing file aborts the granule.

use crate::error::{IngestError, Result};
use crate::lock::ResourceLock;
use crate::models::{Collection, DiscoveredFile, File, Granule, GranuleManifest, Provider};
use crate::protocol::{connect_client, ProtocolClient, ProtocolContext};
use crate::storage::ObjectStore;
use futures::stream::{self, StreamExt};
use granary_common::checksum::{checksums_match, ChecksumHasher};
use granary_common::types::{ChecksumType, DuplicateHandling};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Checksums read from sidecar files, keyed by the file they describe
#[derive(Debug, Default)]
pub struct SidecarChecksums {
    values: HashMap<String, (ChecksumType, String)>,
}

impl SidecarChecksums {
    /// Split a manifest's files into data files and sidecars
    pub fn partition(files: &[DiscoveredFile]) -> (Vec<&DiscoveredFile>, Vec<(&DiscoveredFile, ChecksumType, String)>) {
        let mut data = Vec::new();
        let mut sidecars = Vec::new();
        for file in files {
            let sidecar = file
                .name
                .rsplit_once('.')
                .and_then(|(target, ext)| ChecksumType::from_sidecar_extension(ext).map(|t| (t, target.to_string())));
            match sidecar {
                Some((checksum_type, target)) if !target.is_empty() => sidecars.push((file, checksum_type, target)),
                _ => data.push(file),
            }
        }
        (data, sidecars)
    }

    /// Record the first whitespace-delimited token of a sidecar body
    pub fn insert_from_body(&mut self, target: &str, checksum_type: ChecksumType, body: &str) -> bool {
        match body.split_whitespace().next() {
            Some(value) => {
                self.values
                    .insert(target.to_string(), (checksum_type, value.to_string()));
                true
            },
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<(ChecksumType, &str)> {
        self.values.get(name).map(|(t, v)| (*t, v.as_str()))
    }

    async fn load(
        client: &mut dyn ProtocolClient,
        sidecars: &[(&DiscoveredFile, ChecksumType, String)],
    ) -> Result<Self> {
        let mut checksums = Self::default();
        for (file, checksum_type, target) in sidecars {
            let mut reader = client.fetch(&file.full_path()).await?;
            let mut body = String::new();
            reader.read_to_string(&mut body).await?;
            if !checksums.insert_from_body(target, *checksum_type, &body) {
                warn!(sidecar = %file.name, "Empty checksum sidecar ignored");
            }
        }
        Ok(checksums)
    }
}

/// Stream a remote file to `path`, hashing as it goes; returns (bytes, checksum)
async fn download_hashed(
    client: &mut dyn ProtocolClient,
    remote_path: &str,
    path: &Path,
    checksum_type: ChecksumType,
) -> Result<(u64, String)> {
    let mut reader = client.fetch(remote_path).await?;
    let mut out = tokio::fs::File::create(path).await?;
    let mut hasher = ChecksumHasher::new(checksum_type);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
    }
    out.flush().await?;

    Ok((hasher.bytes_hashed(), hasher.finalize()))
}

pub struct GranuleIngester {
    store: Arc<dyn ObjectStore>,
    staging_prefix: String,
}

impl GranuleIngester {
    pub fn new(store: Arc<dyn ObjectStore>, staging_prefix: impl Into<String>) -> Self {
        Self {
            store,
            staging_prefix: staging_prefix.into(),
        }
    }

    /// Key a staged file is written to
    pub fn staging_key(&self, data_type: &str, version: &str, name: &str) -> String {
        format!(
            "{}/{}___{}/{}",
            self.staging_prefix.trim_end_matches('/'),
            data_type,
            version,
            name
        )
    }

    /// Download, verify and stage every data file of `manifest`
    #[instrument(skip_all, fields(provider = %provider.id, granule_id = %manifest.granule_id))]
    pub async fn ingest(
        &self,
        client: &mut dyn ProtocolClient,
        manifest: &GranuleManifest,
        provider: &Provider,
        collection: &Collection,
        destination_bucket: &str,
        duplicate_handling: Option<DuplicateHandling>,
    ) -> Result<Granule> {
        let policy = duplicate_handling
            .or(collection.duplicate_handling)
            .unwrap_or_default();
        let matcher = collection.matcher()?;

        let (data_files, sidecar_files) = SidecarChecksums::partition(&manifest.files);
        if data_files.is_empty() {
            return Err(IngestError::RemoteResource(format!(
                "Granule {} has no data files",
                manifest.granule_id
            )));
        }
        let sidecars = SidecarChecksums::load(client, &sidecar_files).await?;
        let mut versioning_enabled = false;
        let mut files = Vec::with_capacity(data_files.len());

        for discovered in data_files {
            let key = self.staging_key(&manifest.data_type, &manifest.version, &discovered.name);
            let expected = discovered
                .embedded_checksum()
                .or_else(|| sidecars.get(&discovered.name));

            let url_path = matcher.url_path_template(&discovered.name).map(str::to_string);
            let file_type = discovered
                .file_type
                .clone()
                .or_else(|| matcher.matching_rule(&discovered.name).and_then(|r| r.file_type.clone()));

            if let Some(existing) = self.store.head(destination_bucket, &key).await? {
                match policy {
                    DuplicateHandling::Error => {
                        return Err(IngestError::DuplicateFile(format!("s3://{}/{}", destination_bucket, key)));
                    },
                    DuplicateHandling::Skip => {
                        info!(file = %discovered.name, "Staged object exists, skipping");
                        let mut file = File::new(&discovered.name, destination_bucket, &key, existing.size);
                        if let Some((t, v)) = expected {
                            file.checksum_type = Some(t);
                            file.checksum_value = Some(v.to_string());
                        }
                        file.url_path = url_path;
                        file.file_type = file_type;
                        files.push(file);
                        continue;
                    },
                    DuplicateHandling::Version if !versioning_enabled => {
                        self.store.enable_versioning(destination_bucket).await?;
                        versioning_enabled = true;
                    },
                    DuplicateHandling::Version | DuplicateHandling::Replace => {},
                }
            }

            let checksum_type = expected.map(|(t, _)| t).unwrap_or(ChecksumType::Cksum);
            let temp = tempfile::NamedTempFile::new()?;
            let (size, actual) = download_hashed(client, &discovered.full_path(), temp.path(), checksum_type).await?;

            if let Some((t, expected_value)) = expected {
                if !checksums_match(t, expected_value, &actual) {
                    return Err(IngestError::InvalidChecksum {
                        file: discovered.name.clone(),
                        checksum_type: t,
                        expected: expected_value.to_string(),
                        actual,
                    });
                }
                debug!(file = %discovered.name, checksum_type = %t, "Checksum verified");
            }

            if let Some(listed) = discovered.size.filter(|listed| *listed != size) {
                warn!(file = %discovered.name, listed, downloaded = size, "Downloaded size differs from listing");
            }

            self.store.put_file(destination_bucket, &key, temp.path()).await?;
            info!(file = %discovered.name, bytes = size, "Staged s3://{}/{}", destination_bucket, key);

            let mut file = File::new(&discovered.name, destination_bucket, &key, size);
            file.checksum_type = Some(checksum_type);
            file.checksum_value = Some(actual);
            file.url_path = url_path;
            file.file_type = file_type;
            files.push(file);
        }

        Ok(Granule {
            granule_id: manifest.granule_id.clone(),
            data_type: manifest.data_type.clone(),
            version: manifest.version.clone(),
            files,
        })
    }
}

/// Lock-guarded, connection-managing wrapper around [`GranuleIngester`]
pub struct GranuleSync {
    ingester: GranuleIngester,
    lock: ResourceLock,
    ctx: ProtocolContext,
    destination_bucket: String,
    concurrency: usize,
}

impl GranuleSync {
    pub fn new(
        ingester: GranuleIngester,
        lock: ResourceLock,
        ctx: ProtocolContext,
        destination_bucket: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            ingester,
            lock,
            ctx,
            destination_bucket: destination_bucket.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Ingest one granule under its lock with a dedicated provider session
    #[instrument(skip_all, fields(provider = %provider.id, granule_id = %manifest.granule_id))]
    pub async fn sync_granule(
        &self,
        provider: &Provider,
        collection: &Collection,
        manifest: &GranuleManifest,
        duplicate_handling: Option<DuplicateHandling>,
    ) -> Result<Granule> {
        let guard = self.lock.guard(&provider.id, &manifest.granule_id).await?;
        let mut client = connect_client(provider, &self.ctx).await?;

        let result = self
            .ingester
            .ingest(
                client.as_mut(),
                manifest,
                provider,
                collection,
                &self.destination_bucket,
                duplicate_handling,
            )
            .await;

        if let Err(e) = client.close().await {
            warn!(error = %e, "Failed to close provider session");
        }
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release granule lock");
        }

        match &result {
            Ok(granule) => info!(files = granule.files.len(), "Granule synced"),
            Err(e) => warn!(error = %e, error_name = e.name(), "Granule sync failed"),
        }
        result
    }

    /// Parallel sessions allowed against `provider`
    pub fn concurrency_for(&self, provider: &Provider) -> usize {
        provider
            .global_connection_limit
            .map_or(self.concurrency, |limit| self.concurrency.min(limit))
            .max(1)
    }

    /// Sync many granules, at most `concurrency` at a time and never more than
    /// the provider's connection limit. Results are returned in input order.
    pub async fn sync_granules(
        &self,
        provider: &Provider,
        collection: &Collection,
        manifests: &[GranuleManifest],
        duplicate_handling: Option<DuplicateHandling>,
    ) -> Vec<Result<Granule>> {
        let concurrency = self.concurrency_for(provider);
        debug!(concurrency, granules = manifests.len(), "Syncing granules");
        let mut results: Vec<(usize, Result<Granule>)> = stream::iter(manifests.iter().enumerate())
            .map(|(index, manifest)| async move {
                (
                    index,
                    self.sync_granule(provider, collection, manifest, duplicate_handling)
                        .await,
                )
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}
