//! Test helpers for granary-ingest integration tests
//!
//! This module provides:
//! - An in-memory provider implementing `ProtocolClient`
//! - Collection, bucket and provider fixtures
//! - Tracing setup

#![allow(dead_code)]

use async_trait::async_trait;
use granary_common::checksum::compute_checksum;
use granary_common::types::ChecksumType;
use granary_ingest::error::{IngestError, Result};
use granary_ingest::models::{BucketType, Buckets, Collection, DiscoveredFile, FileRule, Protocol, Provider};
use granary_ingest::protocol::{normalize_dir, ByteStream, ProtocolClient};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,granary_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Provider whose directory tree lives in memory
#[derive(Clone, Default)]
pub struct MockProvider {
    /// directory -> (file name -> contents)
    tree: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    fetches: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, dir: &str, name: &str, body: impl Into<Vec<u8>>) -> Self {
        self.tree
            .entry(normalize_dir(dir))
            .or_default()
            .insert(name.to_string(), body.into());
        self
    }

    /// Number of `fetch` calls served so far
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for MockProvider {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DiscoveredFile>> {
        let dir = normalize_dir(path);
        let files = self
            .tree
            .get(&dir)
            .ok_or_else(|| IngestError::RemoteResource(format!("no such directory {}", dir)))?;
        Ok(files
            .iter()
            .map(|(name, body)| DiscoveredFile::new(name, &dir).with_size(body.len() as u64))
            .collect())
    }

    async fn fetch(&mut self, remote_path: &str) -> Result<ByteStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (dir, name) = remote_path
            .rsplit_once('/')
            .ok_or_else(|| IngestError::RemoteResource(remote_path.to_string()))?;
        let body = self
            .tree
            .get(&normalize_dir(if dir.is_empty() { "/" } else { dir }))
            .and_then(|files| files.get(name))
            .ok_or_else(|| IngestError::RemoteResource(format!("{} not found", remote_path)))?;
        Ok(Box::pin(Cursor::new(body.clone())))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn cksum(body: &[u8]) -> String {
    compute_checksum(&mut &body[..], ChecksumType::Cksum).unwrap()
}

pub fn buckets() -> Buckets {
    let mut buckets = Buckets::default();
    buckets.insert("internal", "granary-internal", BucketType::Internal);
    buckets.insert("private", "granary-private", BucketType::Private);
    buckets.insert("protected", "granary-protected", BucketType::Protected);
    buckets.insert("public", "granary-public", BucketType::Public);
    buckets
}

pub fn provider() -> Provider {
    Provider::new("MODAPS", Protocol::Ftp, "ftp.example.com").with_root_path("/MODOPS/MOD09GQ")
}

/// MOD09GQ collection as used by the MODAPS provider
pub fn mod09gq() -> Collection {
    Collection {
        name: "MOD09GQ".into(),
        version: "006".into(),
        granule_id_extraction: r"^(.*)\.hdf".into(),
        granule_id: Some(r"^MOD09GQ\.A[\d]{7}\.[\S]{6}\.006\.[\d]{13}$".into()),
        sample_file_name: Some("MOD09GQ.A2017025.h21v00.006.2017034065104.hdf".into()),
        files: vec![
            FileRule::new(r"^MOD09GQ\.A[\d]{7}\.[\S]{6}\.006\.[\d]{13}\.hdf$", "protected"),
            FileRule::new(r"^MOD09GQ\.A[\d]{7}\.[\S]{6}\.006\.[\d]{13}\.hdf\.met$", "private"),
            FileRule::new(r"^MOD09GQ\.A[\d]{7}\.[\S]{6}\.006\.[\d]{13}\.hdf\.cmr\.xml$", "public"),
            FileRule {
                url_path: Some("browse".into()),
                ..FileRule::new(r"^MOD09GQ\.A[\d]{7}\.[\S]{6}\.006\.[\d]{13}_ndvi\.jpg$", "public")
            },
        ],
        url_path: Some("{collection.name}___{collection.version}".into()),
        duplicate_handling: None,
    }
}

/// MYG29 collection used by the granule id filter scenario
pub fn myg29() -> Collection {
    Collection {
        name: "MYG29".into(),
        version: "006".into(),
        granule_id_extraction: r"^(MYG29_[NS]1D_SIR\.A\d{7})\..*".into(),
        granule_id: None,
        sample_file_name: None,
        files: vec![FileRule::new(r".*", "protected")],
        url_path: None,
        duplicate_handling: None,
    }
}
