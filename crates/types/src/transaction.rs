//! Mempool transactions.

use crate::Hash;
use sbor::prelude::BasicSbor;

/// Unique transaction identifier, content-derived.
pub type TxId = Hash;

/// A candidate transaction for inclusion in a block.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Tx {
    /// Account that submitted the transaction.
    pub sender: String,
    /// Sender-scoped sequence number.
    pub nonce: u64,
    /// Gas the transaction is willing to consume.
    pub gas: u64,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

impl Tx {
    /// Create a transaction.
    pub fn new(sender: impl Into<String>, nonce: u64, gas: u64, payload: Vec<u8>) -> Self {
        Tx {
            sender: sender.into(),
            nonce,
            gas,
            payload,
        }
    }

    /// Content-derived id, unique across the pool.
    pub fn id(&self) -> TxId {
        let encoded = sbor::basic_encode(self).expect("tx encoding cannot fail");
        Hash::from_bytes(&encoded)
    }

    /// Encoded size in bytes, as counted against mempool byte budgets.
    pub fn size_bytes(&self) -> u64 {
        sbor::basic_encode(self)
            .map(|b| b.len() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_depends_on_content() {
        let a = Tx::new("alice", 0, 10, b"pay".to_vec());
        let b = Tx::new("alice", 0, 10, b"pay".to_vec());
        let c = Tx::new("alice", 1, 10, b"pay".to_vec());
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_size_tracks_payload() {
        let small = Tx::new("a", 0, 1, vec![0u8; 8]);
        let large = Tx::new("a", 0, 1, vec![0u8; 800]);
        assert!(large.size_bytes() > small.size_bytes());
    }
}
