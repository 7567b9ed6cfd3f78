//! Common types used across Granary

use crate::error::GranaryError;
use serde::{Deserialize, Serialize};

/// Checksum algorithm named by provider feeds and collection configuration.
///
/// The serialized names (`CKSUM`, `MD5`, `SHA256`, `SHA512`) are the exact
/// strings used in PDR `FILE_CKSUM_TYPE` values and in granule file records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumType {
    /// POSIX `cksum` CRC-32, rendered as a decimal integer
    #[serde(rename = "CKSUM", alias = "cksum")]
    Cksum,
    #[serde(rename = "MD5", alias = "md5")]
    Md5,
    #[serde(rename = "SHA256", alias = "sha256", alias = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA512", alias = "sha512", alias = "SHA-512")]
    Sha512,
}

impl ChecksumType {
    /// File extension used by checksum sidecar files (`<name>.md5`, ...)
    pub fn sidecar_extension(self) -> &'static str {
        match self {
            ChecksumType::Cksum => "cksum",
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Sha512 => "sha512",
        }
    }

    /// Resolve a sidecar file extension back to its checksum type
    pub fn from_sidecar_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "cksum" => Some(ChecksumType::Cksum),
            "md5" => Some(ChecksumType::Md5),
            "sha256" => Some(ChecksumType::Sha256),
            "sha512" => Some(ChecksumType::Sha512),
            _ => None,
        }
    }
}

impl std::str::FromStr for ChecksumType {
    type Err = GranaryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CKSUM" => Ok(ChecksumType::Cksum),
            "MD5" => Ok(ChecksumType::Md5),
            "SHA256" | "SHA-256" => Ok(ChecksumType::Sha256),
            "SHA512" | "SHA-512" => Ok(ChecksumType::Sha512),
            other => Err(GranaryError::UnsupportedChecksumType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumType::Cksum => write!(f, "CKSUM"),
            ChecksumType::Md5 => write!(f, "MD5"),
            ChecksumType::Sha256 => write!(f, "SHA256"),
            ChecksumType::Sha512 => write!(f, "SHA512"),
        }
    }
}

/// Policy applied when a destination object already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateHandling {
    /// Fail the granule
    Error,
    /// Leave the existing object untouched
    Skip,
    /// Overwrite the existing object
    #[default]
    Replace,
    /// Enable bucket versioning, then overwrite
    Version,
}

impl std::str::FromStr for DuplicateHandling {
    type Err = GranaryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(DuplicateHandling::Error),
            "skip" => Ok(DuplicateHandling::Skip),
            "replace" => Ok(DuplicateHandling::Replace),
            "version" => Ok(DuplicateHandling::Version),
            other => Err(GranaryError::Parse(format!(
                "Invalid duplicate handling: {}",
                other
            ))),
        }
    }
}

/// A bucket/key pair, rendered as `s3://bucket/key`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse an `s3://bucket/key` URI
    pub fn parse(uri: &str) -> crate::Result<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| GranaryError::InvalidLocation(uri.to_string()))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| GranaryError::InvalidLocation(uri.to_string()))?;

        if bucket.is_empty() || key.is_empty() {
            return Err(GranaryError::InvalidLocation(uri.to_string()));
        }

        Ok(Self::new(bucket, key))
    }
}

impl std::fmt::Display for S3Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Join key segments with single slashes, dropping empty segments
pub fn join_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_type_from_str() {
        assert_eq!("CKSUM".parse::<ChecksumType>().unwrap(), ChecksumType::Cksum);
        assert_eq!("md5".parse::<ChecksumType>().unwrap(), ChecksumType::Md5);
        assert_eq!("SHA-256".parse::<ChecksumType>().unwrap(), ChecksumType::Sha256);
        assert!("CRC64".parse::<ChecksumType>().is_err());
    }

    #[test]
    fn test_checksum_type_serde_names() {
        let json = serde_json::to_string(&ChecksumType::Cksum).unwrap();
        assert_eq!(json, "\"CKSUM\"");
        let parsed: ChecksumType = serde_json::from_str("\"md5\"").unwrap();
        assert_eq!(parsed, ChecksumType::Md5);
    }

    #[test]
    fn test_s3_location_round_trip() {
        let loc = S3Location::parse("s3://my-bucket/path/to/file.hdf").unwrap();
        assert_eq!(loc.bucket, "my-bucket");
        assert_eq!(loc.key, "path/to/file.hdf");
        assert_eq!(loc.to_string(), "s3://my-bucket/path/to/file.hdf");
    }

    #[test]
    fn test_s3_location_rejects_bad_uri() {
        assert!(S3Location::parse("http://bucket/key").is_err());
        assert!(S3Location::parse("s3://bucket-only").is_err());
        assert!(S3Location::parse("s3:///key").is_err());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(["a/", "/b", "", "c.txt"]), "a/b/c.txt");
        assert_eq!(join_key(["", "file"]), "file");
    }

    #[test]
    fn test_duplicate_handling_default() {
        assert_eq!(DuplicateHandling::default(), DuplicateHandling::Replace);
        assert_eq!("SKIP".parse::<DuplicateHandling>().unwrap(), DuplicateHandling::Skip);
    }
}
