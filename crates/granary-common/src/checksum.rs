//! Checksum utilities for file verification
//!
//! Provider feeds publish checksums as POSIX `cksum` values (CRC-32 rendered as
//! a decimal integer) or as hex digests. [`ChecksumHasher`] computes any of
//! them incrementally so callers can hash while streaming.

use crate::error::Result;
use crate::types::ChecksumType;
use crc::{Crc, Digest as CrcDigest, CRC_32_CKSUM};
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;

static CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

enum HasherState {
    Cksum(CrcDigest<'static, u32>),
    Md5(md5::Context),
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental checksum computation for any [`ChecksumType`]
pub struct ChecksumHasher {
    state: HasherState,
    length: u64,
}

impl ChecksumHasher {
    pub fn new(checksum_type: ChecksumType) -> Self {
        let state = match checksum_type {
            ChecksumType::Cksum => HasherState::Cksum(CKSUM.digest()),
            ChecksumType::Md5 => HasherState::Md5(md5::Context::new()),
            ChecksumType::Sha256 => HasherState::Sha256(Sha256::new()),
            ChecksumType::Sha512 => HasherState::Sha512(Sha512::new()),
        };

        Self { state, length: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.length += data.len() as u64;
        match &mut self.state {
            HasherState::Cksum(digest) => digest.update(data),
            HasherState::Md5(ctx) => ctx.consume(data),
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha512(hasher) => hasher.update(data),
        }
    }

    /// Number of bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.length
    }

    /// Finish hashing and render the value the way provider feeds do
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Cksum(mut digest) => {
                // POSIX cksum appends the length, least significant octet first
                let mut remaining = self.length;
                while remaining != 0 {
                    digest.update(&[(remaining & 0xff) as u8]);
                    remaining >>= 8;
                }
                digest.finalize().to_string()
            },
            HasherState::Md5(ctx) => format!("{:x}", ctx.compute()),
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Compute checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, checksum_type: ChecksumType) -> Result<String> {
    let mut hasher = ChecksumHasher::new(checksum_type);
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Compare two checksum values of the same type.
///
/// CKSUM values compare numerically (providers sometimes zero-pad them), hex
/// digests compare case-insensitively.
pub fn checksums_match(checksum_type: ChecksumType, expected: &str, actual: &str) -> bool {
    let expected = expected.trim();
    let actual = actual.trim();

    match checksum_type {
        ChecksumType::Cksum => match (expected.parse::<u64>(), actual.parse::<u64>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        _ => expected.eq_ignore_ascii_case(actual),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_cksum_matches_posix_tool() {
        let mut cursor = Cursor::new(b"hello world\n");
        let value = compute_checksum(&mut cursor, ChecksumType::Cksum).unwrap();
        assert_eq!(value, "3733384285");
    }

    #[test]
    fn test_cksum_of_empty_input() {
        let mut cursor = Cursor::new(b"");
        let value = compute_checksum(&mut cursor, ChecksumType::Cksum).unwrap();
        assert_eq!(value, "4294967295");
    }

    #[test]
    fn test_compute_checksum_md5() {
        let mut cursor = Cursor::new(b"hello world\n");
        let value = compute_checksum(&mut cursor, ChecksumType::Md5).unwrap();
        assert_eq!(value, "6f5902ac237024bdd0c176cb93063dc4");
    }

    #[test]
    fn test_compute_checksum_sha256() {
        let mut cursor = Cursor::new(b"hello world\n");
        let value = compute_checksum(&mut cursor, ChecksumType::Sha256).unwrap();
        assert_eq!(value, "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447");
    }

    #[test]
    fn test_checksums_match_rules() {
        assert!(checksums_match(ChecksumType::Cksum, "0003733384285", "3733384285"));
        assert!(!checksums_match(ChecksumType::Cksum, "abc", "abc"));
        assert!(checksums_match(
            ChecksumType::Md5,
            "6F5902AC237024BDD0C176CB93063DC4",
            "6f5902ac237024bdd0c176cb93063dc4"
        ));
    }

    proptest! {
        #[test]
        fn chunked_hashing_matches_single_pass(data in proptest::collection::vec(any::<u8>(), 0..4096), split in 0usize..4096) {
            let split = split.min(data.len());
            for checksum_type in [ChecksumType::Cksum, ChecksumType::Md5, ChecksumType::Sha256] {
                let mut chunked = ChecksumHasher::new(checksum_type);
                chunked.update(&data[..split]);
                chunked.update(&data[split..]);

                let single = compute_checksum(&mut Cursor::new(&data), checksum_type).unwrap();
                prop_assert_eq!(chunked.finalize(), single);
            }
        }
    }
}
