//! Granary Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, checksum algorithms, logging, and error handling for the
//! Granary ingest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`GranaryError`] and the [`Result`] alias
//! - **Checksums**: streaming CKSUM/MD5/SHA-256/SHA-512 used by provider feeds
//! - **Types**: checksum type, duplicate-handling policy, `s3://` locations
//! - **Logging**: `tracing` subscriber initialisation
//!
//! # Example
//!
//! ```no_run
//! use granary_common::checksum::compute_checksum;
//! use granary_common::types::ChecksumType;
//!
//! fn print_cksum(data: &[u8]) -> granary_common::Result<()> {
//!     let value = compute_checksum(&mut &data[..], ChecksumType::Cksum)?;
//!     println!("cksum: {}", value);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{GranaryError, Result};
