//! SHA-256 helpers shared by state models, the script runner and the cache.
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Raw SHA-256 digest.
pub type Sha256Sum = [u8; 32];

/// Compute the SHA-256 digest of `data`.
#[must_use]
pub fn sha256_sum(data: &[u8]) -> Sha256Sum {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex encoding of `bytes`.
#[must_use]
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(hex, "{b:02x}");
    }
    hex
}

/// Lowercase hex SHA-256 digest of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex(&sha256_sum(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_pads_single_digit_bytes() {
        assert_eq!(hex(&[0x00, 0x0f, 0xa0]), "000fa0");
    }
}
