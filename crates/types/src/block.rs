//! Blocks, block ids and block parts.

use crate::{Address, Commit, Hash, Height, MerkleProof, Timestamp, Tx};
use sbor::prelude::BasicSbor;

/// Commitment to a block's part set: how many parts and the merkle root over
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub struct PartSetHeader {
    /// Number of parts the block splits into.
    pub total: u32,
    /// Merkle root over the part bytes.
    pub hash: Hash,
}

impl PartSetHeader {
    /// The zero header, used in the nil block id.
    pub fn zero() -> Self {
        PartSetHeader {
            total: 0,
            hash: Hash::ZERO,
        }
    }

    /// Whether this is the zero header.
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// Identifies a block by its hash plus the part-set commitment used to
/// disseminate it. The nil value (zero hash, zero header) stands for "no
/// block" in votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub struct BlockId {
    /// Hash of the block header.
    pub hash: Hash,
    /// Part-set commitment.
    pub parts: PartSetHeader,
}

impl BlockId {
    /// The nil block id.
    pub fn nil() -> Self {
        BlockId {
            hash: Hash::ZERO,
            parts: PartSetHeader::zero(),
        }
    }

    /// Whether this is the nil id.
    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.parts.is_zero()
    }
}

/// One chunk of a block, with its inclusion proof against the part-set root.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Part {
    /// Index of this part, `0..total`.
    pub index: u32,
    /// Raw chunk bytes.
    pub bytes: Vec<u8>,
    /// Merkle proof of inclusion under [`PartSetHeader::hash`].
    pub proof: MerkleProof,
}

/// Block header: consensus metadata committed by validators.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockHeader {
    /// Chain this block belongs to.
    pub chain_id: String,
    /// Height of this block.
    pub height: Height,
    /// BFT time of the block, milliseconds since epoch.
    pub time: Timestamp,
    /// Id of the previous block (nil for the initial height).
    pub last_block_id: BlockId,
    /// Hash of the previous block's commit.
    pub last_commit_hash: Hash,
    /// Merkle-style hash over the block's transactions.
    pub data_hash: Hash,
    /// Hash of the validator set that validates this block.
    pub validators_hash: Hash,
    /// Application state hash after the previous block.
    pub app_hash: Hash,
    /// Address of the proposer of this block.
    pub proposer_address: Address,
}

/// A full block: header, transaction data and the commit for the previous
/// block.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Block {
    /// Consensus metadata.
    pub header: BlockHeader,
    /// Ordered transactions.
    pub txs: Vec<Tx>,
    /// 2/3+ precommits for the previous block.
    pub last_commit: Commit,
}

impl Block {
    /// Hash of the block: the hash of its encoded header.
    pub fn hash(&self) -> Hash {
        let encoded = sbor::basic_encode(&self.header).expect("header encoding cannot fail");
        Hash::from_bytes(&encoded)
    }

    /// Whether this block hashes to the given value.
    pub fn hashes_to(&self, hash: &Hash) -> bool {
        !hash.is_zero() && self.hash() == *hash
    }

    /// Hash over the transaction data, as recorded in the header.
    pub fn compute_data_hash(txs: &[Tx]) -> Hash {
        let leaves: Vec<Vec<u8>> = txs.iter().map(|tx| tx.id().as_bytes().to_vec()).collect();
        crate::merkle_root(&leaves)
    }

    /// Stateless well-formedness checks.
    ///
    /// Verifies internal consistency only; validity against chain state is
    /// the block executor's job.
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.header.height < 1 {
            return Err(format!("non-positive height {}", self.header.height));
        }
        if self.header.data_hash != Self::compute_data_hash(&self.txs) {
            return Err("data hash does not match transactions".to_string());
        }
        Ok(())
    }
}
