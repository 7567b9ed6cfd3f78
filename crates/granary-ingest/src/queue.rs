//! Workflow message publishing
//!
//! Discovered granules and PDRs are handed to downstream workflows as JSON
//! messages built from a template object. Every message gets a fresh
//! execution name, returned to the caller as the run id.

use crate::error::{IngestError, Result};
use crate::models::{Collection, DiscoveredFile, GranuleManifest, Provider};
use crate::storage::{ObjectStore, StorageConfig};
use async_trait::async_trait;
use granary_common::types::S3Location;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, queue_url: &str, message: &Value) -> Result<()>;
}

/// [`MessageQueue`] over Amazon SQS
#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
}

impl SqsQueue {
    pub async fn new(config: &StorageConfig) -> Self {
        let sdk_config = config.sdk_config().await;
        Self {
            client: aws_sdk_sqs::Client::new(&sdk_config),
        }
    }

    pub fn from_client(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    #[instrument(skip(self, message))]
    async fn send(&self, queue_url: &str, message: &Value) -> Result<()> {
        let output = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(message.to_string())
            .send()
            .await
            .map_err(|e| IngestError::Queue(format!("send to {}: {}", queue_url, e)))?;
        debug!(message_id = ?output.message_id(), "Message sent");
        Ok(())
    }
}

/// Messages kept per queue URL
#[derive(Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, Vec<Value>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, queue_url: &str) -> Vec<Value> {
        self.queues
            .lock()
            .map(|q| q.get(queue_url).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, queue_url: &str, message: &Value) -> Result<()> {
        self.queues
            .lock()
            .map_err(|_| IngestError::Queue("queue lock poisoned".to_string()))?
            .entry(queue_url.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}

pub struct QueuePublisher {
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn MessageQueue>,
    default_queue_url: Option<String>,
}

impl QueuePublisher {
    pub fn new(store: Arc<dyn ObjectStore>, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            store,
            queue,
            default_queue_url: None,
        }
    }

    /// Queue used when the template names none
    pub fn with_default_queue(mut self, queue_url: impl Into<String>) -> Self {
        self.default_queue_url = Some(queue_url.into());
        self
    }

    async fn load_template(&self, template_uri: &str) -> Result<Value> {
        let location = S3Location::parse(template_uri)?;
        let body = self.store.get(&location.bucket, &location.key).await?;
        let template: Value = serde_json::from_slice(&body)?;
        if !template.is_object() {
            return Err(IngestError::Queue(format!("template {} is not a JSON object", template_uri)));
        }
        Ok(template)
    }

    /// Fill the template and send it, returning the execution name
    #[instrument(skip(self, payload, provider, collection), fields(provider = %provider.id))]
    pub async fn publish(
        &self,
        template_uri: &str,
        payload: Value,
        provider: &Provider,
        collection: Option<&Collection>,
    ) -> Result<String> {
        let mut message = self.load_template(template_uri).await?;
        let run_id = Uuid::new_v4().to_string();

        let queue_url = message
            .pointer("/cumulus_meta/queueUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.default_queue_url.clone())
            .ok_or_else(|| IngestError::Queue(format!("no queueUrl in {} and no default queue", template_uri)))?;

        let object = message
            .as_object_mut()
            .ok_or_else(|| IngestError::Queue("template is not an object".to_string()))?;
        let meta = object.entry("meta").or_insert_with(|| json!({}));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("provider".to_string(), serde_json::to_value(provider)?);
            meta.insert(
                "collection".to_string(),
                collection.map(serde_json::to_value).transpose()?.unwrap_or(Value::Null),
            );
        }
        let cumulus_meta = object.entry("cumulus_meta").or_insert_with(|| json!({}));
        if let Some(cumulus_meta) = cumulus_meta.as_object_mut() {
            cumulus_meta.insert("execution_name".to_string(), Value::String(run_id.clone()));
        }
        object.insert("payload".to_string(), payload);

        self.queue.send(&queue_url, &message).await?;
        info!(run_id = %run_id, queue_url = %queue_url, "Workflow message queued");
        Ok(run_id)
    }

    /// One message per granule, payload `{granules: [granule]}`
    pub async fn enqueue_granules(
        &self,
        template_uri: &str,
        granules: &[GranuleManifest],
        provider: &Provider,
        collection: &Collection,
    ) -> Result<Vec<String>> {
        let mut run_ids = Vec::with_capacity(granules.len());
        for granule in granules {
            let payload = json!({ "granules": [granule] });
            run_ids.push(self.publish(template_uri, payload, provider, Some(collection)).await?);
        }
        Ok(run_ids)
    }

    /// One message per PDR, payload `{pdr: {name, path}}`
    pub async fn enqueue_pdrs(&self, template_uri: &str, pdrs: &[DiscoveredFile], provider: &Provider) -> Result<Vec<String>> {
        let mut run_ids = Vec::with_capacity(pdrs.len());
        for pdr in pdrs {
            let payload = json!({ "pdr": { "name": pdr.name, "path": pdr.remote_path } });
            run_ids.push(self.publish(template_uri, payload, provider, None).await?);
        }
        Ok(run_ids)
    }
}
