//! FTP provider client
//!
//! suppaftp's blocking `FtpStream` is driven from `spawn_blocking`. The
//! session moves into the blocking task for each command and comes back with
//! the result. All transfers use Extended Passive Mode (EPSV) and binary type.

use super::{normalize_dir, timeout_error, ByteStream, ProtocolClient, ProtocolContext};
use crate::error::{IngestError, Result};
use crate::models::{DiscoveredFile, Provider};
use async_trait::async_trait;
use std::io::{Seek, SeekFrom};
use std::net::ToSocketAddrs;
use std::time::Duration;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct FtpConfig {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

pub struct FtpClient {
    config: FtpConfig,
    stream: Option<FtpStream>,
}

impl FtpClient {
    pub fn new(provider: &Provider, ctx: &ProtocolContext) -> Self {
        Self {
            config: FtpConfig {
                host: provider.host.clone(),
                port: provider.port(),
                username: ctx
                    .credentials
                    .username
                    .clone()
                    .unwrap_or_else(|| "anonymous".to_string()),
                password: ctx.credentials.password.clone().unwrap_or_default(),
                timeout: ctx.connect_timeout,
            },
            stream: None,
        }
    }

    /// Run one blocking command against the open session
    async fn with_stream<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| IngestError::Connection("FTP session is not connected".to_string()))?;

        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|e| IngestError::Connection(format!("FTP task panicked: {}", e)))?;

        self.stream = Some(stream);
        result
    }

    fn connect_sync(config: &FtpConfig) -> Result<FtpStream> {
        debug!("Connecting to FTP server: {}:{}", config.host, config.port);

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| IngestError::Connection(format!("Cannot resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| IngestError::Connection(format!("No address for {}", config.host)))?;

        let mut stream = FtpStream::connect_timeout(addr, config.timeout)
            .map_err(|e| map_ftp_error(&format!("connect to {}", config.host), e))?;

        stream.get_ref().set_read_timeout(Some(config.timeout))?;
        stream.set_mode(suppaftp::Mode::ExtendedPassive);

        debug!("Logging in as: {}", config.username);
        stream
            .login(&config.username, &config.password)
            .map_err(|e| map_ftp_error("login", e))?;

        stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .map_err(|e| map_ftp_error("set binary mode", e))?;

        Ok(stream)
    }
}

fn map_ftp_error(action: &str, e: FtpError) -> IngestError {
    match e {
        FtpError::ConnectionError(io)
            if matches!(io.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) =>
        {
            IngestError::ConnectionTimeout(format!("FTP {}: {}", action, io))
        },
        FtpError::ConnectionError(io) => IngestError::Connection(format!("FTP {}: {}", action, io)),
        FtpError::UnexpectedResponse(response) => {
            let message = format!(
                "FTP {}: {:?} {}",
                action,
                response.status,
                String::from_utf8_lossy(&response.body).trim()
            );
            if response.status == Status::NotLoggedIn {
                IngestError::Auth(message)
            } else {
                IngestError::RemoteResource(message)
            }
        },
        other => IngestError::Connection(format!("FTP {}: {}", action, other)),
    }
}

#[async_trait]
impl ProtocolClient for FtpClient {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let config = self.config.clone();
        let stream = tokio::task::spawn_blocking(move || Self::connect_sync(&config))
            .await
            .map_err(|e| IngestError::Connection(format!("FTP connect task panicked: {}", e)))?;

        match stream {
            Ok(stream) => {
                info!(host = %self.config.host, "FTP session established");
                self.stream = Some(stream);
                Ok(())
            },
            Err(IngestError::ConnectionTimeout(_)) => Err(timeout_error(
                &format!("FTP connect to {}", self.config.host),
                self.config.timeout,
            )),
            Err(e) => Err(e),
        }
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DiscoveredFile>> {
        let dir = normalize_dir(path);
        let listing_dir = dir.clone();

        let lines = self
            .with_stream(move |stream| {
                stream
                    .list(Some(&listing_dir))
                    .map_err(|e| map_ftp_error(&format!("list {}", listing_dir), e))
            })
            .await?;

        let files: Vec<DiscoveredFile> = lines
            .iter()
            .filter_map(|line| FtpEntry::parse(line))
            .filter(|entry| !entry.is_directory)
            .map(|entry| {
                let mut file = DiscoveredFile::new(entry.name, dir.clone());
                file.size = entry.size;
                file
            })
            .collect();

        debug!("Listed {} ({} files)", dir, files.len());
        Ok(files)
    }

    async fn fetch(&mut self, remote_path: &str) -> Result<ByteStream> {
        let path = remote_path.to_string();

        let file = self
            .with_stream(move |stream| {
                let mut file = tempfile::tempfile()?;
                let bytes = stream
                    .retr(&path, |reader| {
                        std::io::copy(reader, &mut file).map_err(FtpError::ConnectionError)
                    })
                    .map_err(|e| map_ftp_error(&format!("retrieve {}", path), e))?;
                file.seek(SeekFrom::Start(0))?;
                debug!("Downloaded {} bytes from {}", bytes, path);
                Ok(file)
            })
            .await?;

        Ok(Box::pin(tokio::fs::File::from_std(file)))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        match tokio::task::spawn_blocking(move || stream.quit()).await {
            Ok(Ok(())) => debug!("FTP session closed"),
            Ok(Err(e)) => warn!("Failed to quit FTP session gracefully: {}", e),
            Err(e) => warn!("FTP quit task panicked: {}", e),
        }
        Ok(())
    }
}

/// Parsed FTP directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    /// Entry name; for symlinks the link name, not its target
    pub name: String,

    pub is_directory: bool,

    pub is_symlink: bool,

    /// File size in bytes (if available)
    pub size: Option<u64>,
}

impl FtpEntry {
    /// Parse a Unix-style LIST line
    ///
    /// `drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 dirname`
    /// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 file name.txt`
    /// `lrwxrwxrwx   1 ftp ftp    12 Jan 15 12:00 latest -> file.txt`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        let mut rest = line.trim_start();
        let mut fields = Vec::with_capacity(8);

        // Eight metadata fields precede the name, which may contain spaces
        while fields.len() < 8 {
            let end = rest.find(char::is_whitespace)?;
            fields.push(&rest[..end]);
            rest = rest[end..].trim_start();
        }

        if rest.is_empty() || rest == "." || rest == ".." {
            return None;
        }

        let kind = fields[0].chars().next()?;
        let is_symlink = kind == 'l';
        let name = if is_symlink {
            rest.split_once(" -> ").map_or(rest, |(link, _)| link)
        } else {
            rest
        };

        Some(Self {
            name: name.to_string(),
            is_directory: kind == 'd',
            is_symlink,
            size: fields[4].parse().ok(),
        })
    }
}
