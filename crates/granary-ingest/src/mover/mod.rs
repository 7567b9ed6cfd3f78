//! Post-ingest file moves
//!
//! Staged files are relocated to their archive buckets once routing is known.
//! A move is copy-then-delete and is not atomic: a failed delete leaves the
//! source behind as residue and the move still succeeds. The granule's
//! metadata document, if any, has its access URLs rewritten for the new
//! locations and is optionally published to the metadata catalog.
//!
//! Url path templates of the files and destination paths are rendered here,
//! against `{file, granule, collection, cmrMetadata}`, since the metadata
//! document is only available once the granule is staged.

pub mod catalog;
pub mod metadata;

pub use catalog::{CmrClient, InMemoryCatalog, MetadataCatalog};
pub use metadata::MetadataFormat;

use crate::error::{IngestError, Result};
use crate::models::{Buckets, Collection, File};
use crate::storage::ObjectStore;
use crate::template;
use granary_common::types::{join_key, S3Location};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Where files whose name matches `regex` are moved. `filepath` may be a
/// url path template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDestination {
    pub regex: String,
    pub bucket: String,
    pub filepath: String,
}

impl MoveDestination {
    pub fn new(regex: impl Into<String>, bucket: impl Into<String>, filepath: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            bucket: bucket.into(),
            filepath: filepath.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResult {
    pub files: Vec<File>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept_id: Option<String>,
}

pub struct FileMover {
    store: Arc<dyn ObjectStore>,
    buckets: Buckets,
    catalog: Option<Arc<dyn MetadataCatalog>>,
    collection: Option<Collection>,
}

/// Metadata document of a granule, read before its files move
struct MetadataDocument {
    name: String,
    format: MetadataFormat,
    body: String,
    parsed: Value,
}

impl FileMover {
    pub fn new(store: Arc<dyn ObjectStore>, buckets: Buckets) -> Self {
        Self {
            store,
            buckets,
            catalog: None,
            collection: None,
        }
    }

    /// Expose the collection record to url path templates
    pub fn with_collection(mut self, collection: Collection) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn MetadataCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Copy one object and delete the source. A failed delete is only logged.
    async fn move_object(&self, source: &S3Location, target: &S3Location) -> Result<()> {
        if source == target {
            return Ok(());
        }

        self.store.copy(source, target).await?;
        if let Err(e) = self.store.delete(&source.bucket, &source.key).await {
            warn!(source = %source, target = %target, error = %e, "Source left behind after move");
        }
        debug!(source = %source, target = %target, "Moved");
        Ok(())
    }

    /// Move a granule's files to their destinations and rewrite its metadata
    #[instrument(skip(self, files, destinations, distribution_endpoint), fields(files = files.len()))]
    pub async fn move_granule(
        &self,
        granule_id: &str,
        files: Vec<File>,
        destinations: &[MoveDestination],
        distribution_endpoint: &str,
        publish: bool,
    ) -> Result<MoveResult> {
        let rules = destinations
            .iter()
            .map(|d| Regex::new(&d.regex).map(|re| (re, d)).map_err(IngestError::from))
            .collect::<Result<Vec<_>>>()?;
        let document = self.read_metadata(&files).await?;
        let cmr_metadata = document.as_ref().map_or(Value::Null, |d| d.parsed.clone());

        let mut moved = Vec::with_capacity(files.len());
        for mut file in files {
            let context = json!({
                "file": &file,
                "granule": { "granuleId": granule_id },
                "collection": &self.collection,
                "cmrMetadata": &cmr_metadata,
            });
            if let Some(tpl) = file.url_path.take() {
                file.url_path = Some(template::render(&tpl, &context)?);
            }

            match rules.iter().find(|(re, _)| re.is_match(&file.name)) {
                Some((_, destination)) => {
                    let filepath = template::render(&destination.filepath, &context)?;
                    let target = S3Location::new(
                        destination.bucket.clone(),
                        join_key([filepath.as_str(), file.name.as_str()]),
                    );
                    self.move_object(&file.location(), &target).await?;
                    file.relocate(target.bucket, target.key);
                },
                None => debug!(file = %file.name, "No destination matches; left in place"),
            }
            moved.push(file);
        }

        let concept_id = match document {
            Some(document) => {
                self.update_metadata(granule_id, document, &moved, distribution_endpoint, publish)
                    .await?
            },
            None => None,
        };

        info!(granule_id, concept_id = ?concept_id, "Granule files moved");
        Ok(MoveResult {
            files: moved,
            concept_id,
        })
    }

    /// First `.cmr.xml`/`.cmr.json` file of the granule, read and parsed
    async fn read_metadata(&self, files: &[File]) -> Result<Option<MetadataDocument>> {
        let Some((file, format)) = files
            .iter()
            .find_map(|f| MetadataFormat::from_file_name(&f.name).map(|fmt| (f, fmt)))
        else {
            return Ok(None);
        };

        let body = self.store.get(&file.bucket, &file.filepath).await?;
        let body = String::from_utf8(body)
            .map_err(|_| IngestError::Metadata(format!("{} is not valid UTF-8", file.name)))?;
        let parsed = metadata::to_json(format, &body)?;
        Ok(Some(MetadataDocument {
            name: file.name.clone(),
            format,
            body,
            parsed,
        }))
    }

    async fn update_metadata(
        &self,
        granule_id: &str,
        document: MetadataDocument,
        files: &[File],
        distribution_endpoint: &str,
        publish: bool,
    ) -> Result<Option<String>> {
        let format = document.format;
        let target = files
            .iter()
            .find(|f| f.name == document.name)
            .ok_or_else(|| IngestError::Metadata(format!("{} missing after move", document.name)))?;
        let rewritten = metadata::rewrite(format, &document.body, files, &self.buckets, distribution_endpoint)?;

        let concept_id = if publish {
            let catalog = self
                .catalog
                .as_ref()
                .ok_or_else(|| IngestError::Config("publish requested without a metadata catalog".to_string()))?;
            Some(catalog.publish(granule_id, format, rewritten.as_bytes()).await?)
        } else {
            None
        };

        self.store
            .put(&target.bucket, &target.filepath, rewritten.into_bytes())
            .await?;
        debug!(document = %target.filename, "Metadata document rewritten");
        Ok(concept_id)
    }
}
