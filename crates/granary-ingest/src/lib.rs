//! Granary Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Discovery, transfer, verification and archiving of science data granules
//! delivered by remote providers.
//!
//! # Pipeline
//!
//! - **Discovery**: list a provider over FTP, SFTP, HTTP(S) or S3 and group
//!   files into granules by the collection's id extraction pattern
//! - **PDR parsing**: turn Product Delivery Records into granule manifests
//! - **Granule ingest**: stream files to staging while verifying checksums,
//!   serialized per granule by a lease lock
//! - **File moves**: relocate staged files and rewrite their metadata
//!   document, optionally publishing it to CMR
//! - **Queueing**: hand granules and PDRs to downstream workflows
//!
//! # Example
//!
//! ```no_run
//! use granary_ingest::{CollectionStore, DiscoveryEngine, IngestConfig, InMemoryCollections, S3ObjectStore};
//! use granary_ingest::models::{Protocol, Provider};
//! use granary_ingest::protocol::{connect_client, ProtocolContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let store = Arc::new(S3ObjectStore::new(&config.storage).await);
//!     let collections = InMemoryCollections::new();
//!     let collection = collections.get("MOD09GQ", "006").await?;
//!
//!     let provider = Provider::new("MODAPS", Protocol::Ftp, "ftp.example.com");
//!     let ctx = ProtocolContext::new(store.clone(), config.connect_timeout());
//!     let mut client = connect_client(&provider, &ctx).await?;
//!
//!     let engine = DiscoveryEngine::new(store, config.buckets.clone(), &config.stack, &config.internal_bucket);
//!     let granules = engine.discover_granules(&mut *client, &provider, &collection).await?;
//!     println!("{} granules", granules.len());
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod collections;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod granule;
pub mod lock;
pub mod models;
pub mod mover;
pub mod pdr;
pub mod protocol;
pub mod queue;
pub mod storage;
pub mod template;

// Re-export commonly used types
pub use collections::{CollectionStore, InMemoryCollections, ObjectStoreCollections};
pub use config::IngestConfig;
pub use discovery::DiscoveryEngine;
pub use error::{IngestError, Result};
pub use granule::{GranuleIngester, GranuleSync};
pub use lock::{LockGuard, ResourceLock};
pub use mover::{FileMover, MoveDestination, MoveResult};
pub use pdr::{PdrParseResult, PdrParser};
pub use queue::{MessageQueue, QueuePublisher};
pub use storage::{InMemoryObjectStore, ObjectStore, S3ObjectStore};
