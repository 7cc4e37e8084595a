//! Content hashing for deduplication and integrity checks
//!
//! Raw report artifacts are addressed by the SHA-256 of the exact bytes as
//! received, computed before any decompression.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};

/// Compute the lowercase hex SHA-256 digest of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that `data` hashes to `expected`
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual == expected {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
