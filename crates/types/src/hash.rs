//! Content-addressed hashes.

use sbor::prelude::BasicSbor;
use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero hash. Used as the "nil" marker in block ids.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Number of bytes in a hash.
    pub const LEN: usize = 32;

    /// Hash arbitrary input bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Hash(out)
    }

    /// Wrap an existing 32-byte digest.
    pub fn from_hash_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero (nil) hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::ZERO
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form keeps tracing output readable.
        write!(f, "Hash({}..)", hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = Hash::from_bytes(b"hello");
        let b = Hash::from_bytes(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, Hash::from_bytes(b"world"));
    }

    #[test]
    fn test_zero_hash() {
        assert!(Hash::ZERO.is_zero());
        assert!(!Hash::from_bytes(b"x").is_zero());
        assert_eq!(Hash::default(), Hash::ZERO);
    }

    #[test]
    fn test_sbor_round_trip() {
        let h = Hash::from_bytes(b"round trip");
        let encoded = sbor::basic_encode(&h).unwrap();
        let decoded: Hash = sbor::basic_decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }
}
