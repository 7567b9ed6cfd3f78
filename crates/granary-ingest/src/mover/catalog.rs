//! Metadata catalog publication
//!
//! The rewritten metadata document of a granule can be published to a CMR
//! catalog. The catalog answers with a concept id, which is recorded on the
//! granule.

use crate::config::CmrConfig;
use crate::error::{IngestError, Result};
use crate::mover::metadata::MetadataFormat;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, instrument};

#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    /// Publish a granule metadata document, returning its concept id
    async fn publish(&self, granule_id: &str, format: MetadataFormat, document: &[u8]) -> Result<String>;
}

/// Concept id from a CMR ingest response, JSON or XML
fn concept_id(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return value
            .get("concept-id")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    let start = body.find("<concept-id>")? + "<concept-id>".len();
    let end = body[start..].find("</concept-id>")? + start;
    Some(body[start..end].trim().to_string())
}

/// CMR ingest API client
pub struct CmrClient {
    client: Client,
    endpoint: String,
    provider: String,
    client_id: String,
    token: Option<String>,
}

impl CmrClient {
    pub fn new(config: &CmrConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| IngestError::Config("CMR endpoint is not configured".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("granary/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Catalog(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            provider: config.provider.clone(),
            client_id: config.client_id.clone(),
            token: config.token.clone(),
        })
    }

    fn granule_url(&self, granule_id: &str) -> String {
        format!(
            "{}/ingest/providers/{}/granules/{}",
            self.endpoint,
            self.provider,
            url::form_urlencoded::byte_serialize(granule_id.as_bytes()).collect::<String>()
        )
    }
}

#[async_trait]
impl MetadataCatalog for CmrClient {
    #[instrument(skip(self, document), fields(provider = %self.provider))]
    async fn publish(&self, granule_id: &str, format: MetadataFormat, document: &[u8]) -> Result<String> {
        let mut request = self
            .client
            .put(self.granule_url(granule_id))
            .header(header::CONTENT_TYPE, format.content_type())
            .header(header::ACCEPT, "application/json")
            .header("Client-Id", &self.client_id)
            .body(document.to_vec());
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::Catalog(format!("publish {}: {}", granule_id, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IngestError::Catalog(format!("publish {}: {}", granule_id, e)))?;

        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    IngestError::Auth(format!("CMR rejected credentials ({}): {}", status, body))
                },
                _ => IngestError::Catalog(format!("CMR returned {} for {}: {}", status, granule_id, body)),
            });
        }

        let concept_id = concept_id(&body)
            .ok_or_else(|| IngestError::Catalog(format!("no concept-id in CMR response for {}", granule_id)))?;
        info!(granule_id, concept_id = %concept_id, "Published granule metadata");
        Ok(concept_id)
    }
}

/// Records published documents; used by tests and dry runs
#[derive(Default)]
pub struct InMemoryCatalog {
    published: Mutex<Vec<(String, MetadataFormat, Vec<u8>)>>,
    fail: AtomicBool,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, MetadataFormat, Vec<u8>)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MetadataCatalog for InMemoryCatalog {
    async fn publish(&self, granule_id: &str, format: MetadataFormat, document: &[u8]) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(IngestError::Catalog(format!("publish {} rejected", granule_id)));
        }
        let mut published = self
            .published
            .lock()
            .map_err(|_| IngestError::Catalog("catalog lock poisoned".to_string()))?;
        published.push((granule_id.to_string(), format, document.to_vec()));
        Ok(format!("G{}-GRANARY", published.len()))
    }
}
