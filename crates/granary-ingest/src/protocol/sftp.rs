//! SFTP provider client over an embedded russh session

use super::{normalize_dir, timeout_error, ByteStream, ProtocolClient, ProtocolContext};
use crate::error::{IngestError, Result};
use crate::models::{DiscoveredFile, Provider};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh_sftp::client::SftpSession;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Host keys are not pinned; providers are addressed by configuration only
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &ssh_key::PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Session {
    ssh: Handle<AcceptingHandler>,
    sftp: SftpSession,
}

pub struct SftpClient {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<String>,
    timeout: Duration,
    session: Option<Session>,
}

fn map_ssh_error(action: &str, e: russh::Error) -> IngestError {
    match e {
        russh::Error::IO(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            IngestError::ConnectionTimeout(format!("SFTP {}: {}", action, io))
        },
        russh::Error::ConnectionTimeout | russh::Error::InactivityTimeout => {
            IngestError::ConnectionTimeout(format!("SFTP {}: {}", action, e))
        },
        other => IngestError::Connection(format!("SFTP {}: {}", action, other)),
    }
}

fn map_sftp_error(action: &str, e: russh_sftp::client::error::Error) -> IngestError {
    IngestError::RemoteResource(format!("SFTP {}: {}", action, e))
}

impl SftpClient {
    pub fn new(provider: &Provider, ctx: &ProtocolContext) -> Self {
        Self {
            host: provider.host.clone(),
            port: provider.port(),
            username: ctx.credentials.username.clone().unwrap_or_default(),
            password: ctx.credentials.password.clone(),
            private_key: ctx.credentials.private_key.clone(),
            timeout: ctx.connect_timeout,
            session: None,
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| IngestError::Connection("SFTP session is not connected".to_string()))
    }

    async fn open_session(&self) -> Result<Session> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.timeout),
            ..Default::default()
        });

        let mut ssh = client::connect(config, (self.host.as_str(), self.port), AcceptingHandler)
            .await
            .map_err(|e| map_ssh_error(&format!("connect to {}", self.host), e))?;

        let authenticated = match (&self.private_key, &self.password) {
            (Some(pem), _) => {
                let key = decode_secret_key(pem, None)
                    .map_err(|e| IngestError::Auth(format!("Invalid SSH private key: {}", e)))?;
                let hash = ssh
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| map_ssh_error("negotiate key hash", e))?
                    .flatten();
                ssh.authenticate_publickey(&self.username, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                    .await
                    .map_err(|e| map_ssh_error("authenticate", e))?
            },
            (None, Some(password)) => ssh
                .authenticate_password(&self.username, password)
                .await
                .map_err(|e| map_ssh_error("authenticate", e))?,
            (None, None) => ssh
                .authenticate_none(&self.username)
                .await
                .map_err(|e| map_ssh_error("authenticate", e))?,
        };

        if !authenticated.success() {
            return Err(IngestError::Auth(format!(
                "SFTP login rejected for {}@{}",
                self.username, self.host
            )));
        }

        let channel = ssh
            .channel_open_session()
            .await
            .map_err(|e| map_ssh_error("open channel", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| map_ssh_error("request sftp subsystem", e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| IngestError::Connection(format!("SFTP handshake: {}", e)))?;

        Ok(Session { ssh, sftp })
    }
}

#[async_trait]
impl ProtocolClient for SftpClient {
    async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        debug!("Connecting to SFTP server: {}:{}", self.host, self.port);
        let session = tokio::time::timeout(self.timeout, self.open_session())
            .await
            .map_err(|_| timeout_error(&format!("SFTP connect to {}", self.host), self.timeout))??;

        info!(host = %self.host, "SFTP session established");
        self.session = Some(session);
        Ok(())
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DiscoveredFile>> {
        let dir = normalize_dir(path);
        let session = self.session()?;

        let entries = session
            .sftp
            .read_dir(dir.as_str())
            .await
            .map_err(|e| map_sftp_error(&format!("list {}", dir), e))?;

        let mut files = Vec::new();
        for entry in entries {
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let mut file = DiscoveredFile::new(name, dir.clone());
            file.size = entry.metadata().size;
            files.push(file);
        }

        debug!("Listed {} ({} files)", dir, files.len());
        Ok(files)
    }

    async fn fetch(&mut self, remote_path: &str) -> Result<ByteStream> {
        let session = self.session()?;
        let file = session
            .sftp
            .open(remote_path)
            .await
            .map_err(|e| map_sftp_error(&format!("open {}", remote_path), e))?;

        Ok(Box::pin(file))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        if let Err(e) = session.sftp.close().await {
            warn!("Failed to close SFTP subsystem: {}", e);
        }
        if let Err(e) = session
            .ssh
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("Failed to disconnect SSH session gracefully: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::models::Protocol;
    use crate::storage::InMemoryObjectStore;

    fn client(port: u16) -> SftpClient {
        let ctx = ProtocolContext::new(Arc::new(InMemoryObjectStore::new()), Duration::from_secs(5))
            .with_credentials(Credentials {
                username: Some("user".into()),
                password: Some("pass".into()),
                private_key: None,
            });
        let mut provider = Provider::new("p", Protocol::Sftp, "127.0.0.1");
        provider.port = Some(port);
        SftpClient::new(&provider, &ctx)
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut client = client(22);
        assert!(matches!(client.list("/").await, Err(IngestError::Connection(_))));
        assert!(client.fetch("/a").await.is_err());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let mut client = client(1);
        let err = client.connect().await.unwrap_err();
        assert!(err.is_retryable());
        client.close().await.unwrap();
    }

    /// Needs an SFTP server at SFTP_TEST_HOST (user/pass from SFTP_TEST_USER/SFTP_TEST_PASSWORD)
    #[tokio::test]
    #[ignore]
    async fn test_live_listing() {
        let host = std::env::var("SFTP_TEST_HOST").unwrap();
        let ctx = ProtocolContext::new(Arc::new(InMemoryObjectStore::new()), Duration::from_secs(10))
            .with_credentials(Credentials {
                username: std::env::var("SFTP_TEST_USER").ok(),
                password: std::env::var("SFTP_TEST_PASSWORD").ok(),
                private_key: None,
            });
        let provider = Provider::new("live", Protocol::Sftp, host);
        let mut client = SftpClient::new(&provider, &ctx);
        client.connect().await.unwrap();
        let files = client.list("/").await.unwrap();
        println!("{} files", files.len());
        client.close().await.unwrap();
    }
}
