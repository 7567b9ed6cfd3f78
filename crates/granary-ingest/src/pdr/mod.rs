//! Product Delivery Record parsing
//!
//! A PDR lists FILE_GROUPs, each naming a collection (DATA_TYPE, DATA_VERSION)
//! and the FILE_SPECs delivered for it. Parsing is all-or-nothing: any
//! malformed FILE_GROUP or FILE_SPEC rejects the whole record with `InvalidPdr`.

pub mod pan;
pub mod pvl;

use crate::collections::CollectionStore;
use crate::discovery::pdr_archive_key;
use crate::error::{IngestError, Result};
use crate::models::{Collection, DiscoveredFile, GranuleManifest};
use crate::protocol::ProtocolClient;
use crate::storage::ObjectStore;
use granary_common::types::ChecksumType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdrParseResult {
    pub granules: Vec<GranuleManifest>,
    pub total_size: u64,
    pub files_count: usize,
    pub granules_count: usize,
}

fn required<'a>(object: &'a pvl::PvlObject, key: &str) -> Result<&'a str> {
    object
        .get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IngestError::InvalidPdr(format!("{} is missing {}", object.name, key)))
}

fn parse_file_spec(spec: &pvl::PvlObject) -> Result<DiscoveredFile> {
    let directory = required(spec, "DIRECTORY_ID")?;
    let file_id = required(spec, "FILE_ID")?;
    let size = required(spec, "FILE_SIZE")?;
    let size: u64 = size
        .parse()
        .map_err(|_| IngestError::InvalidPdr(format!("FILE_SIZE of {} is not a number: {}", file_id, size)))?;

    let mut file = DiscoveredFile::new(file_id, directory).with_size(size);
    file.file_type = spec.get("FILE_TYPE").map(str::to_string);

    let checksum_type = spec.get("FILE_CKSUM_TYPE").map(str::trim).filter(|v| !v.is_empty());
    let checksum_value = spec.get("FILE_CKSUM_VALUE").map(str::trim).filter(|v| !v.is_empty());
    match (checksum_type, checksum_value) {
        (Some(t), Some(v)) => {
            let t: ChecksumType = t
                .parse()
                .map_err(|_| IngestError::InvalidPdr(format!("{} has unsupported FILE_CKSUM_TYPE {}", file_id, t)))?;
            file = file.with_checksum(t, v);
        },
        (None, None) => {},
        (Some(_), None) => {
            return Err(IngestError::InvalidPdr(format!("{} has FILE_CKSUM_TYPE without FILE_CKSUM_VALUE", file_id)));
        },
        (None, Some(_)) => {
            return Err(IngestError::InvalidPdr(format!("{} has FILE_CKSUM_VALUE without FILE_CKSUM_TYPE", file_id)));
        },
    }

    Ok(file)
}

pub struct PdrParser {
    collections: Arc<dyn CollectionStore>,
    granule_id_filter: Option<Regex>,
}

impl PdrParser {
    pub fn new(collections: Arc<dyn CollectionStore>) -> Self {
        Self {
            collections,
            granule_id_filter: None,
        }
    }

    /// Keep only granules whose id matches `pattern`
    pub fn with_granule_id_filter(mut self, pattern: &str) -> Result<Self> {
        self.granule_id_filter = Some(Regex::new(pattern)?);
        Ok(self)
    }

    async fn collection(&self, cache: &mut HashMap<(String, String), Collection>, data_type: &str, version: &str) -> Result<Collection> {
        let key = (data_type.to_string(), version.to_string());
        if let Some(collection) = cache.get(&key) {
            return Ok(collection.clone());
        }
        let collection = self.collections.get(data_type, version).await?;
        cache.insert(key, collection.clone());
        Ok(collection)
    }

    /// Parse PDR text into granule manifests
    #[instrument(skip_all)]
    pub async fn parse(&self, text: &str) -> Result<PdrParseResult> {
        let document = pvl::parse(text)?;
        let groups: Vec<_> = document.objects("FILE_GROUP").collect();
        if groups.is_empty() {
            return Err(IngestError::InvalidPdr("no FILE_GROUP found".to_string()));
        }

        let mut cache = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut granules: HashMap<String, GranuleManifest> = HashMap::new();

        for group in groups {
            let data_type = required(group, "DATA_TYPE")?;
            let version = required(group, "DATA_VERSION")?;
            let collection = self.collection(&mut cache, data_type, version).await?;
            let matcher = collection.matcher()?;

            let specs: Vec<_> = group.objects("FILE_SPEC").collect();
            if specs.is_empty() {
                return Err(IngestError::InvalidPdr(format!(
                    "FILE_GROUP for {}___{} has no FILE_SPEC",
                    data_type, version
                )));
            }

            for spec in specs {
                let file = parse_file_spec(spec)?;
                let granule_id = matcher.granule_id(&file.name).ok_or_else(|| {
                    IngestError::InvalidPdr(format!(
                        "FILE_ID {} does not match granuleIdExtraction {}",
                        file.name, collection.granule_id_extraction
                    ))
                })?;
                if !matcher.is_valid_granule_id(&granule_id) {
                    return Err(IngestError::InvalidPdr(format!(
                        "granule id {} fails validation for {}",
                        granule_id,
                        collection.collection_id()
                    )));
                }

                granules
                    .entry(granule_id.clone())
                    .or_insert_with(|| {
                        order.push(granule_id.clone());
                        GranuleManifest {
                            granule_id,
                            data_type: collection.name.clone(),
                            version: collection.version.clone(),
                            files: Vec::new(),
                        }
                    })
                    .files
                    .push(file);
            }
        }

        let granules: Vec<GranuleManifest> = order
            .into_iter()
            .filter_map(|id| granules.remove(&id))
            .filter(|g| {
                self.granule_id_filter
                    .as_ref()
                    .map_or(true, |re| re.is_match(&g.granule_id))
            })
            .collect();

        let files_count = granules.iter().map(|g| g.files.len()).sum();
        let total_size = granules
            .iter()
            .flat_map(|g| &g.files)
            .filter_map(|f| f.size)
            .sum();

        debug!(granules = granules.len(), files_count, total_size, "Parsed PDR");
        Ok(PdrParseResult {
            granules_count: granules.len(),
            granules,
            total_size,
            files_count,
        })
    }

    /// Fetch a PDR from the provider, archive a copy, and parse it
    #[instrument(skip(self, client, store), fields(pdr = %pdr.name))]
    pub async fn parse_from_provider(
        &self,
        client: &mut dyn ProtocolClient,
        pdr: &DiscoveredFile,
        store: &dyn ObjectStore,
        internal_bucket: &str,
        stack: &str,
    ) -> Result<PdrParseResult> {
        let mut reader = client.fetch(&pdr.full_path()).await?;
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;

        store
            .put(internal_bucket, &pdr_archive_key(stack, &pdr.name), body.clone())
            .await?;
        info!(bytes = body.len(), "Archived PDR");

        let text = String::from_utf8(body)
            .map_err(|_| IngestError::InvalidPdr(format!("{} is not valid UTF-8", pdr.name)))?;
        self.parse(&text).await
    }
}
