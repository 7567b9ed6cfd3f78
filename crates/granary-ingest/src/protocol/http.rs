//! HTTP/HTTPS provider client
//!
//! Directory listings are plain index pages; every `<a href>` pointing at a
//! file directly under the listed directory becomes an entry.

use super::{normalize_dir, ByteStream, ProtocolClient, ProtocolContext};
use crate::error::{IngestError, Result};
use crate::models::{DiscoveredFile, Provider};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};
use url::Url;

pub struct HttpClient {
    base_url: Url,
    list_path: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
    client: Option<Client>,
}

fn map_request_error(action: &str, e: reqwest::Error) -> IngestError {
    if e.is_timeout() {
        IngestError::ConnectionTimeout(format!("HTTP {}: {}", action, e))
    } else if e.is_connect() {
        IngestError::Connection(format!("HTTP {}: {}", action, e))
    } else {
        IngestError::RemoteResource(format!("HTTP {}: {}", action, e))
    }
}

fn check_status(url: &Url, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(IngestError::Auth(format!("{} returned {}", url, status))),
        _ => Err(IngestError::RemoteResource(format!("{} returned {}", url, status))),
    }
}

/// File names linked from an index page for `page_url`
pub fn parse_index_links(html: &str, page_url: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut names = BTreeSet::new();
    for href in document.select(&selector).filter_map(|a| a.value().attr("href")) {
        let Ok(target) = page_url.join(href) else {
            continue;
        };
        if target.origin() != page_url.origin() || target.query().is_some() {
            continue;
        }

        // Only direct children of the listed directory
        let Some(relative) = target.path().strip_prefix(page_url.path()) else {
            continue;
        };
        if relative.is_empty() || relative.contains('/') {
            continue;
        }

        let decoded = url::form_urlencoded::parse(format!("n={}", relative.replace('+', "%2B")).as_bytes())
            .next()
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| relative.to_string());
        names.insert(decoded);
    }
    names.into_iter().collect()
}

impl HttpClient {
    pub fn new(provider: &Provider, ctx: &ProtocolContext) -> Result<Self> {
        let base = match provider.port {
            Some(port) => format!("{}://{}:{}", provider.protocol, provider.host, port),
            None => format!("{}://{}", provider.protocol, provider.host),
        };
        let base_url = Url::parse(&base)
            .map_err(|e| IngestError::Config(format!("Invalid provider URL {}: {}", base, e)))?;

        Ok(Self {
            base_url,
            list_path: provider.list_path.clone(),
            username: ctx.credentials.username.clone(),
            password: ctx.credentials.password.clone(),
            timeout: ctx.connect_timeout,
            client: None,
        })
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| IngestError::Connection("HTTP client is not connected".to_string()))
    }

    fn url_for(&self, path: &str, directory: bool) -> Result<Url> {
        let mut path = normalize_dir(path);
        if directory && !path.ends_with('/') {
            path.push('/');
        }
        self.base_url
            .join(&path)
            .map_err(|e| IngestError::Config(format!("Invalid path {}: {}", path, e)))
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response> {
        let mut request = self.client()?.get(url.clone());
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_request_error(&format!("GET {}", url), e))?;
        check_status(url, response.status())?;
        Ok(response)
    }
}

#[async_trait]
impl ProtocolClient for HttpClient {
    async fn connect(&mut self) -> Result<()> {
        if self.client.is_none() {
            let client = Client::builder()
                .connect_timeout(self.timeout)
                .user_agent(concat!("granary/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| IngestError::Connection(format!("Failed to build HTTP client: {}", e)))?;
            self.client = Some(client);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&mut self, path: &str) -> Result<Vec<DiscoveredFile>> {
        let dir = normalize_dir(path);
        let page_url = self.url_for(self.list_path.as_deref().unwrap_or(&dir), true)?;

        let body = self
            .get(&page_url)
            .await?
            .text()
            .await
            .map_err(|e| map_request_error(&format!("read {}", page_url), e))?;

        let files: Vec<DiscoveredFile> = parse_index_links(&body, &page_url)
            .into_iter()
            .map(|name| DiscoveredFile::new(name, dir.clone()))
            .collect();

        debug!("Listed {} ({} files)", page_url, files.len());
        Ok(files)
    }

    #[instrument(skip(self))]
    async fn fetch(&mut self, remote_path: &str) -> Result<ByteStream> {
        let url = self.url_for(remote_path, false)?;
        let response = self.get(&url).await?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_links() {
        let page = Url::parse("http://provider.test/data/").unwrap();
        let html = r#"
            <html><body>
            <a href="../">Parent</a>
            <a href="?C=N;O=D">Name</a>
            <a href="subdir/">subdir/</a>
            <a href="MOD09GQ.A2017224.hdf">MOD09GQ.A2017224.hdf</a>
            <a href="/data/MOD09GQ.A2017224.hdf.md5">md5</a>
            <a href="http://elsewhere.test/data/x.hdf">external</a>
            <a href="read%20me.txt">read me</a>
            </body></html>
        "#;

        let names = parse_index_links(html, &page);
        assert_eq!(
            names,
            vec!["MOD09GQ.A2017224.hdf", "MOD09GQ.A2017224.hdf.md5", "read me.txt"]
        );
    }

    #[test]
    fn test_status_mapping() {
        let url = Url::parse("http://provider.test/a").unwrap();
        assert!(matches!(check_status(&url, StatusCode::UNAUTHORIZED), Err(IngestError::Auth(_))));
        assert!(matches!(check_status(&url, StatusCode::FORBIDDEN), Err(IngestError::RemoteResource(_))));
        assert!(matches!(check_status(&url, StatusCode::NOT_FOUND), Err(IngestError::RemoteResource(_))));
        assert!(matches!(
            check_status(&url, StatusCode::BAD_GATEWAY),
            Err(IngestError::RemoteResource(_))
        ));
        assert!(check_status(&url, StatusCode::OK).is_ok());
    }
}
