//! Provider transport clients
//!
//! Every provider protocol is reached through [`ProtocolClient`]. Callers pick
//! an implementation with [`connect_client`] and never branch on protocol
//! themselves.

use crate::credentials::Credentials;
use crate::error::{IngestError, Result};
use crate::models::{DiscoveredFile, Protocol, Provider};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::debug;

pub mod ftp;
pub mod http;
pub mod s3;
pub mod sftp;

pub use ftp::FtpClient;
pub use http::HttpClient;
pub use s3::S3Client;
pub use sftp::SftpClient;

/// Sequential reader over a remote file
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ProtocolClient: Send {
    /// Open the session. Refusal and timeout are reported separately from
    /// rejected credentials.
    async fn connect(&mut self) -> Result<()>;

    /// Files of one directory level; directories are omitted
    async fn list(&mut self, path: &str) -> Result<Vec<DiscoveredFile>>;

    /// Open a remote file for reading from offset 0
    async fn fetch(&mut self, remote_path: &str) -> Result<ByteStream>;

    /// End the session; safe to call repeatedly or after a failed connect
    async fn close(&mut self) -> Result<()>;
}

/// Everything a client needs beyond the provider record
#[derive(Clone)]
pub struct ProtocolContext {
    pub credentials: Credentials,
    /// Backing store for `s3` providers
    pub object_store: Arc<dyn ObjectStore>,
    pub connect_timeout: Duration,
}

impl ProtocolContext {
    pub fn new(object_store: Arc<dyn ObjectStore>, connect_timeout: Duration) -> Self {
        Self {
            credentials: Credentials::default(),
            object_store,
            connect_timeout,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Build the client matching `provider.protocol` without connecting
pub fn build_client(provider: &Provider, ctx: &ProtocolContext) -> Result<Box<dyn ProtocolClient>> {
    let client: Box<dyn ProtocolClient> = match provider.protocol {
        Protocol::Ftp => Box::new(FtpClient::new(provider, ctx)),
        Protocol::Sftp => Box::new(SftpClient::new(provider, ctx)),
        Protocol::Http | Protocol::Https => Box::new(HttpClient::new(provider, ctx)?),
        Protocol::S3 => Box::new(S3Client::new(provider, ctx)),
    };
    Ok(client)
}

/// Build and connect the client matching `provider.protocol`
pub async fn connect_client(provider: &Provider, ctx: &ProtocolContext) -> Result<Box<dyn ProtocolClient>> {
    debug!(provider = %provider.id, protocol = %provider.protocol, host = %provider.host, "Connecting to provider");
    let mut client = build_client(provider, ctx)?;
    if let Err(e) = client.connect().await {
        let _ = client.close().await;
        return Err(e);
    }
    Ok(client)
}

/// Collapse duplicate and trailing slashes; the root stays `/`
pub fn normalize_dir(path: &str) -> String {
    let absolute = path.starts_with('/');
    let joined = path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => String::new(),
        (true, false) => format!("/{}", joined),
        (false, false) => joined,
    }
}

pub(crate) fn timeout_error(what: &str, timeout: Duration) -> IngestError {
    IngestError::ConnectionTimeout(format!("{} timed out after {:?}", what, timeout))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    #[test]
    fn test_normalize_dir() {
        assert_eq!(normalize_dir("/data//incoming/"), "/data/incoming");
        assert_eq!(normalize_dir("///"), "/");
        assert_eq!(normalize_dir("data/"), "data");
        assert_eq!(normalize_dir(""), "");
    }

    #[tokio::test]
    async fn test_factory_selects_by_protocol() {
        let ctx = ProtocolContext::new(Arc::new(InMemoryObjectStore::new()), Duration::from_secs(1));
        for protocol in [Protocol::Ftp, Protocol::Sftp, Protocol::Http, Protocol::Https, Protocol::S3] {
            let provider = Provider::new("p", protocol, "localhost");
            assert!(build_client(&provider, &ctx).is_ok());
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        // Nothing listens on port 1
        let ctx = ProtocolContext::new(Arc::new(InMemoryObjectStore::new()), Duration::from_secs(5));
        let mut provider = Provider::new("p", Protocol::Ftp, "127.0.0.1");
        provider.port = Some(1);

        let err = connect_client(&provider, &ctx).await.err().unwrap();
        assert!(matches!(
            err,
            IngestError::Connection(_) | IngestError::ConnectionTimeout(_)
        ));
        assert!(err.is_retryable());
    }
}
