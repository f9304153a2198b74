//! SHA-256 helpers shared by the container readers

use sha2::{Digest, Sha256};

use crate::error::{ContainerError, ContainerResult};

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    hex::encode(h.finalize())
}

/// Verify `data` against a declared hex digest (case-insensitive)
pub fn verify_sha256(name: &str, data: &[u8], expected: &str) -> ContainerResult<()> {
    let actual = sha256_hex(data);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ContainerError::IntegrityMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
