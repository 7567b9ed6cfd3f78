//! Production Acceptance Notifications (PAN) and PDR Discrepancy (PDRD) messages
//!
//! PANs report per-file outcomes back to the provider after ingest; a PDRD
//! reports a PDR that could not be parsed at all. Both use the same
//! `KEY = VALUE;` text form as the PDR itself.

use crate::error::IngestError;
use crate::models::DiscoveredFile;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Per-file disposition reported in a long PAN
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDisposition {
    Successful,
    NetworkFailure,
    ChecksumVerificationFailed,
    FileNotFound,
    PostTransferFailure,
}

impl FileDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileDisposition::Successful => "SUCCESSFUL",
            FileDisposition::NetworkFailure => "NETWORK FAILURE",
            FileDisposition::ChecksumVerificationFailed => "CHECKSUM VERIFICATION FAILURE",
            FileDisposition::FileNotFound => "FILE NOT FOUND",
            FileDisposition::PostTransferFailure => "POST-TRANSFER FILE VERIFICATION FAILURE",
        }
    }

    /// Disposition for an ingest failure
    pub fn from_error(error: &IngestError) -> Self {
        match error {
            IngestError::InvalidChecksum { .. } => FileDisposition::ChecksumVerificationFailed,
            IngestError::RemoteResource(_) => FileDisposition::FileNotFound,
            IngestError::Connection(_) | IngestError::ConnectionTimeout(_) | IngestError::Auth(_) => {
                FileDisposition::NetworkFailure
            },
            _ => FileDisposition::PostTransferFailure,
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Short PAN: every file of the PDR succeeded
pub fn short_pan(at: DateTime<Utc>) -> String {
    format!(
        "MESSAGE_TYPE = SHORTPAN;\nDISPOSITION = \"{}\";\nTIME_STAMP = {};\n",
        FileDisposition::Successful.as_str(),
        timestamp(at)
    )
}

/// Long PAN with one disposition per file
pub fn long_pan(files: &[(DiscoveredFile, FileDisposition)], at: DateTime<Utc>) -> String {
    let mut pan = format!("MESSAGE_TYPE = LONGPAN;\nNO_OF_FILES = {};\n", files.len());
    for (file, disposition) in files {
        let _ = write!(
            pan,
            "FILE_DIRECTORY = {};\nFILE_NAME = {};\nDISPOSITION = \"{}\";\nTIME_STAMP = {};\n",
            file.remote_path,
            file.name,
            disposition.as_str(),
            timestamp(at)
        );
    }
    pan
}

/// PAN for a batch: short when everything succeeded, long otherwise
pub fn pan(files: &[(DiscoveredFile, FileDisposition)], at: DateTime<Utc>) -> String {
    if files.iter().all(|(_, d)| *d == FileDisposition::Successful) {
        short_pan(at)
    } else {
        long_pan(files, at)
    }
}

/// Short PDRD for a PDR rejected during parsing
pub fn pdrd(error: &str) -> String {
    format!(
        "MESSAGE_TYPE = SHORTPDRD;\nDISPOSITION = \"{}\";\n",
        error.replace('"', "'")
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 9, 13, 19, 52, 31).unwrap()
    }

    #[test]
    fn test_short_pan() {
        assert_eq!(
            short_pan(at()),
            "MESSAGE_TYPE = SHORTPAN;\nDISPOSITION = \"SUCCESSFUL\";\nTIME_STAMP = 2017-09-13T19:52:31Z;\n"
        );
    }

    #[test]
    fn test_long_pan_when_any_file_fails() {
        let files = vec![
            (DiscoveredFile::new("a.hdf", "/data"), FileDisposition::Successful),
            (
                DiscoveredFile::new("b.hdf", "/data"),
                FileDisposition::from_error(&IngestError::InvalidChecksum {
                    file: "b.hdf".into(),
                    checksum_type: granary_common::types::ChecksumType::Cksum,
                    expected: "1".into(),
                    actual: "2".into(),
                }),
            ),
        ];

        let pan = pan(&files, at());
        assert!(pan.starts_with("MESSAGE_TYPE = LONGPAN;\nNO_OF_FILES = 2;\n"));
        assert!(pan.contains("FILE_NAME = b.hdf;\nDISPOSITION = \"CHECKSUM VERIFICATION FAILURE\";"));
    }

    #[test]
    fn test_pdrd_escapes_quotes() {
        let pdrd = pdrd("FILE_SPEC is missing \"FILE_ID\"");
        assert_eq!(
            pdrd,
            "MESSAGE_TYPE = SHORTPDRD;\nDISPOSITION = \"FILE_SPEC is missing 'FILE_ID'\";\n"
        );
    }
}
