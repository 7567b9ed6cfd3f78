//! Ingest data model
//!
//! Provider and collection records are read-only configuration handed in by
//! the orchestrator. Manifests and granules are produced fresh on each pass.
//! All records serialize with camelCase keys; the [`Granule`]/[`File`] shape is
//! the contract consumed by downstream cataloging and must stay stable.

use crate::error::{IngestError, Result};
use granary_common::types::{join_key, ChecksumType, DuplicateHandling, S3Location};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Provider
// ============================================================================

/// Transport protocol spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Sftp,
    Http,
    Https,
    S3,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp => 21,
            Protocol::Sftp => 22,
            Protocol::Http => 80,
            Protocol::Https | Protocol::S3 => 443,
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ftp" => Ok(Protocol::Ftp),
            "sftp" => Ok(Protocol::Sftp),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "s3" => Ok(Protocol::S3),
            other => Err(IngestError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Ftp => "ftp",
            Protocol::Sftp => "sftp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::S3 => "s3",
        };
        f.write_str(name)
    }
}

/// External endpoint granules are fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub protocol: Protocol,
    /// Hostname, or the source bucket for the `s3` protocol
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Username and password are base64 RSA ciphertexts
    #[serde(default)]
    pub encrypted: bool,
    /// Name of a PEM private key kept in the stack's crypto prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,
    /// Listing override for providers that publish an index apart from the data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_connection_limit: Option<usize>,
}

impl Provider {
    pub fn new(id: impl Into<String>, protocol: Protocol, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol,
            host: host.into(),
            port: None,
            username: None,
            password: None,
            encrypted: false,
            private_key: None,
            root_path: None,
            list_path: None,
            global_connection_limit: None,
        }
    }

    pub fn with_root_path(mut self, path: impl Into<String>) -> Self {
        self.root_path = Some(path.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Directory discovery starts from
    pub fn discovery_path(&self) -> &str {
        self.root_path.as_deref().unwrap_or("/")
    }
}

// ============================================================================
// Buckets
// ============================================================================

/// Access class of a destination bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    #[default]
    Private,
    /// Served through the distribution endpoint
    Protected,
    /// Referenced directly
    Public,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    #[serde(rename = "type", default)]
    pub bucket_type: BucketType,
}

/// Map from configuration bucket key (`"protected"`, `"private"`, ...) to bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Buckets(pub HashMap<String, Bucket>);

impl Buckets {
    pub fn insert(&mut self, key: impl Into<String>, name: impl Into<String>, bucket_type: BucketType) {
        self.0.insert(
            key.into(),
            Bucket {
                name: name.into(),
                bucket_type,
            },
        );
    }

    pub fn resolve(&self, key: &str) -> Result<&Bucket> {
        self.0
            .get(key)
            .ok_or_else(|| IngestError::Config(format!("Unknown bucket key: {}", key)))
    }

    /// Access class of a bucket, looked up by its real name
    pub fn type_of(&self, bucket_name: &str) -> Option<BucketType> {
        self.0
            .values()
            .find(|b| b.name == bucket_name)
            .map(|b| b.bucket_type)
    }
}

// ============================================================================
// Collection
// ============================================================================

/// One file-type rule of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRule {
    pub regex: String,
    /// Bucket key, resolved through [`Buckets`]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

impl FileRule {
    pub fn new(regex: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            bucket: bucket.into(),
            url_path: None,
            file_type: None,
        }
    }
}

/// Logical dataset configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    /// Data type (short name)
    pub name: String,
    pub version: String,
    /// Regex with one capture group yielding the granule id
    pub granule_id_extraction: String,
    /// Optional validation regex for extracted ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_file_name: Option<String>,
    #[serde(default)]
    pub files: Vec<FileRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_handling: Option<DuplicateHandling>,
}

impl Collection {
    /// `{name}___{version}`, the key collections are stored and staged under
    pub fn collection_id(&self) -> String {
        format!("{}___{}", self.name, self.version)
    }

    pub fn matcher(&self) -> Result<CollectionMatcher<'_>> {
        CollectionMatcher::new(self)
    }

    /// Compile the patterns and, when a sample file name is configured, check
    /// that it yields a valid granule id and matches a file rule
    pub fn validate(&self) -> Result<()> {
        let matcher = self.matcher()?;
        let Some(sample) = self.sample_file_name.as_deref() else {
            return Ok(());
        };

        let invalid = |reason: &str| {
            IngestError::Config(format!(
                "Collection {}: sample file {} {}",
                self.collection_id(),
                sample,
                reason
            ))
        };
        let granule_id = matcher
            .granule_id(sample)
            .ok_or_else(|| invalid("does not match granuleIdExtraction"))?;
        if !matcher.is_valid_granule_id(&granule_id) {
            return Err(invalid("yields an id rejected by granuleId"));
        }
        if matcher.matching_rule(sample).is_none() {
            return Err(invalid("matches no file rule"));
        }
        Ok(())
    }
}

/// A collection with its regular expressions compiled once per pass
pub struct CollectionMatcher<'a> {
    collection: &'a Collection,
    extraction: Regex,
    validation: Option<Regex>,
    rules: Vec<(Regex, &'a FileRule)>,
}

impl<'a> CollectionMatcher<'a> {
    fn new(collection: &'a Collection) -> Result<Self> {
        let extraction = Regex::new(&collection.granule_id_extraction)?;
        let validation = collection
            .granule_id
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        let rules = collection
            .files
            .iter()
            .map(|rule| Ok((Regex::new(&rule.regex)?, rule)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            collection,
            extraction,
            validation,
            rules,
        })
    }

    pub fn collection(&self) -> &'a Collection {
        self.collection
    }

    /// First capture group of the extraction pattern applied to `file_name`
    pub fn granule_id(&self, file_name: &str) -> Option<String> {
        self.extraction
            .captures(file_name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn is_valid_granule_id(&self, granule_id: &str) -> bool {
        self.validation
            .as_ref()
            .map_or(true, |re| re.is_match(granule_id))
    }

    /// Most specific matching rule: the longest pattern among the matches
    pub fn matching_rule(&self, file_name: &str) -> Option<&'a FileRule> {
        self.rules
            .iter()
            .filter(|(re, _)| re.is_match(file_name))
            .max_by_key(|(_, rule)| rule.regex.len())
            .map(|(_, rule)| *rule)
    }

    /// URL path template for a file, falling back to the collection default
    pub fn url_path_template(&self, file_name: &str) -> Option<&'a str> {
        self.matching_rule(file_name)
            .and_then(|rule| rule.url_path.as_deref())
            .or(self.collection.url_path.as_deref())
    }
}

// ============================================================================
// Files and granules
// ============================================================================

/// Raw listing or PDR entry before ingest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFile {
    pub name: String,
    /// Remote directory holding the file
    pub remote_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_type: Option<ChecksumType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_value: Option<String>,
    /// Destination bucket name once matched against a file rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

impl DiscoveredFile {
    pub fn new(name: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_path: remote_path.into(),
            size: None,
            checksum_type: None,
            checksum_value: None,
            bucket: None,
            file_type: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum_type: ChecksumType, value: impl Into<String>) -> Self {
        self.checksum_type = Some(checksum_type);
        self.checksum_value = Some(value.into());
        self
    }

    /// Path to request from the provider
    pub fn full_path(&self) -> String {
        let joined = join_key([self.remote_path.as_str(), self.name.as_str()]);
        if self.remote_path.starts_with('/') {
            format!("/{}", joined)
        } else {
            joined
        }
    }

    /// Embedded checksum, if both type and value are present
    pub fn embedded_checksum(&self) -> Option<(ChecksumType, &str)> {
        match (self.checksum_type, self.checksum_value.as_deref()) {
            (Some(t), Some(v)) if !v.is_empty() => Some((t, v)),
            _ => None,
        }
    }
}

/// Granule before ingest: the files still live on the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GranuleManifest {
    pub granule_id: String,
    pub data_type: String,
    pub version: String,
    pub files: Vec<DiscoveredFile>,
}

/// A staged or archived file. Every field is always serialized, absent
/// values as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub name: String,
    pub bucket: String,
    pub filepath: String,
    /// Always `s3://{bucket}/{filepath}`
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub checksum_type: Option<ChecksumType>,
    #[serde(default)]
    pub checksum_value: Option<String>,
    #[serde(default)]
    pub url_path: Option<String>,
    #[serde(rename = "type", default)]
    pub file_type: Option<String>,
}

impl File {
    pub fn new(name: impl Into<String>, bucket: impl Into<String>, filepath: impl Into<String>, size: u64) -> Self {
        let bucket = bucket.into();
        let filepath = filepath.into();
        Self {
            name: name.into(),
            filename: S3Location::new(bucket.clone(), filepath.clone()).to_string(),
            bucket,
            filepath,
            size,
            checksum_type: None,
            checksum_value: None,
            url_path: None,
            file_type: None,
        }
    }

    pub fn location(&self) -> S3Location {
        S3Location::new(self.bucket.clone(), self.filepath.clone())
    }

    /// Point the record at a new object, keeping `filename` consistent
    pub fn relocate(&mut self, bucket: impl Into<String>, filepath: impl Into<String>) {
        self.bucket = bucket.into();
        self.filepath = filepath.into();
        self.filename = self.location().to_string();
    }
}

/// Granule after ingest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Granule {
    pub granule_id: String,
    pub data_type: String,
    pub version: String,
    pub files: Vec<File>,
}
