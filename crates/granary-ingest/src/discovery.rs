//! Granule and PDR discovery
//!
//! Discovery lists one provider directory, keeps files the collection knows how
//! to route, and drops anything already present at its destination. It never
//! fails on a single bad entry: listing and existence-check failures are logged
//! and the affected files are left out of the result. A url path that needs
//! granule metadata cannot be rendered yet, so such files are kept unchecked.

use crate::error::Result;
use crate::models::{Buckets, Collection, CollectionMatcher, DiscoveredFile, GranuleManifest, Provider};
use crate::protocol::ProtocolClient;
use crate::storage::ObjectStore;
use crate::template;
use granary_common::types::join_key;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Key PDRs are archived under once processed
pub fn pdr_archive_key(stack: &str, name: &str) -> String {
    format!("{}/pdrs/{}", stack, name)
}

pub struct DiscoveryEngine {
    store: Arc<dyn ObjectStore>,
    buckets: Buckets,
    stack: String,
    internal_bucket: String,
}

impl DiscoveryEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        buckets: Buckets,
        stack: impl Into<String>,
        internal_bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            buckets,
            stack: stack.into(),
            internal_bucket: internal_bucket.into(),
        }
    }

    /// Route one listing entry; `None` when the collection has no use for it.
    /// The key is `None` when the destination is not known before ingest.
    fn classify(
        &self,
        matcher: &CollectionMatcher<'_>,
        mut file: DiscoveredFile,
    ) -> Option<(String, DiscoveredFile, Option<String>)> {
        let granule_id = matcher.granule_id(&file.name)?;
        if !matcher.is_valid_granule_id(&granule_id) {
            debug!(file = %file.name, granule_id = %granule_id, "Extracted granule id failed validation");
            return None;
        }

        let rule = matcher.matching_rule(&file.name)?;
        let bucket = match self.buckets.resolve(&rule.bucket) {
            Ok(bucket) => bucket,
            Err(e) => {
                warn!(file = %file.name, error = %e, "File rule names an unknown bucket");
                return None;
            },
        };

        file.bucket = Some(bucket.name.clone());
        file.file_type = rule.file_type.clone();

        let url_path = match matcher.url_path_template(&file.name) {
            Some(tpl) => {
                let context = json!({ "file": &file, "collection": matcher.collection() });
                match template::render(tpl, &context) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        debug!(file = %file.name, error = %e, "Url path not renderable before ingest");
                        None
                    },
                }
            },
            None => Some(String::new()),
        };

        let key = url_path.map(|path| join_key([path.as_str(), file.name.as_str()]));
        Some((granule_id, file, key))
    }

    /// New granules available on the provider for `collection`
    #[instrument(skip_all, fields(provider = %provider.id, collection = %collection.collection_id()))]
    pub async fn discover_granules(
        &self,
        client: &mut dyn ProtocolClient,
        provider: &Provider,
        collection: &Collection,
    ) -> Result<Vec<GranuleManifest>> {
        let matcher = collection.matcher()?;
        let path = provider.discovery_path();

        let listing = match client.list(path).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(path, error = %e, "Provider listing failed");
                return Ok(Vec::new());
            },
        };
        let listed = listing.len();

        let mut groups: BTreeMap<String, Vec<DiscoveredFile>> = BTreeMap::new();
        for entry in listing {
            let Some((granule_id, file, key)) = self.classify(&matcher, entry) else {
                continue;
            };
            let Some(key) = key else {
                groups.entry(granule_id).or_default().push(file);
                continue;
            };
            let bucket = file.bucket.clone().unwrap_or_default();

            match self.store.exists(&bucket, &key).await {
                Ok(true) => {
                    debug!(bucket = %bucket, key = %key, "Already ingested");
                },
                Ok(false) => groups.entry(granule_id).or_default().push(file),
                Err(e) => {
                    warn!(bucket = %bucket, key = %key, error = %e, "Existence check failed");
                },
            }
        }

        let granules: Vec<GranuleManifest> = groups
            .into_iter()
            .map(|(granule_id, mut files)| {
                files.sort_by(|a, b| a.name.cmp(&b.name));
                GranuleManifest {
                    granule_id,
                    data_type: collection.name.clone(),
                    version: collection.version.clone(),
                    files,
                }
            })
            .collect();

        info!(listed, granules = granules.len(), "Discovery complete");
        Ok(granules)
    }

    /// PDRs on the provider that have not been archived yet
    #[instrument(skip_all, fields(provider = %provider.id))]
    pub async fn discover_pdrs(&self, client: &mut dyn ProtocolClient, provider: &Provider) -> Result<Vec<DiscoveredFile>> {
        let path = provider.discovery_path();
        let listing = match client.list(path).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(path, error = %e, "Provider listing failed");
                return Ok(Vec::new());
            },
        };

        let mut pdrs = Vec::new();
        for file in listing
            .into_iter()
            .filter(|f| f.name.to_ascii_uppercase().ends_with(".PDR"))
        {
            let key = pdr_archive_key(&self.stack, &file.name);
            match self.store.exists(&self.internal_bucket, &key).await {
                Ok(false) => pdrs.push(file),
                Ok(true) => debug!(pdr = %file.name, "PDR already processed"),
                Err(e) => warn!(pdr = %file.name, error = %e, "Existence check failed"),
            }
        }

        pdrs.sort_by(|a, b| a.name.cmp(&b.name));
        info!(pdrs = pdrs.len(), "PDR discovery complete");
        Ok(pdrs)
    }
}
