//! Digest helpers for canonical record hashing

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Digest algorithm used for record hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Compute the lowercase hex digest of a byte slice
pub fn digest_hex(algorithm: HashAlgorithm, data: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
    }
}

/// Incremental digest over a sequence of parts
///
/// Parts are fed as-is; callers are responsible for separators.
pub enum DigestBuilder {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestBuilder {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => DigestBuilder::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => DigestBuilder::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, part: impl AsRef<[u8]>) {
        match self {
            DigestBuilder::Sha256(hasher) => hasher.update(part),
            DigestBuilder::Sha512(hasher) => hasher.update(part),
        }
    }

    pub fn finish_hex(self) -> String {
        match self {
            DigestBuilder::Sha256(hasher) => hex::encode(hasher.finalize()),
            DigestBuilder::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_sha256() {
        assert_eq!(
            digest_hex(HashAlgorithm::Sha256, b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_builder_matches_one_shot() {
        let mut builder = DigestBuilder::new(HashAlgorithm::Sha512);
        builder.update("hello");
        builder.update(" ");
        builder.update("world");
        assert_eq!(builder.finish_hex(), digest_hex(HashAlgorithm::Sha512, b"hello world"));
    }
}
