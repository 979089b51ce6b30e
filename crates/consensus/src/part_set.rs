//! Chunked block assembly.
//!
//! Blocks travel the network as fixed-size parts, each carrying a merkle
//! proof against the part-set root in the proposal's [`PartSetHeader`].
//! Receivers verify each part on arrival and reassemble the block once all
//! parts are present.

use basalt_types::{merkle_proofs, Block, Part, PartSetHeader};
use tracing::debug;

/// Fixed part size: 64 KiB.
pub const BLOCK_PART_SIZE_BYTES: usize = 64 * 1024;

/// A block split into verified chunks, possibly still incomplete.
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    /// Number of parts present.
    count: u32,
    /// Total bytes of the parts present.
    byte_size: u64,
}

impl PartSet {
    /// Split a block into parts, committing to them with a merkle root.
    pub fn from_block(block: &Block) -> Self {
        let encoded = sbor::basic_encode(block).expect("block encoding cannot fail");
        let chunks: Vec<&[u8]> = encoded.chunks(BLOCK_PART_SIZE_BYTES).collect();
        let (root, proofs) = merkle_proofs(&chunks);
        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (bytes, proof))| {
                Some(Part {
                    index: index as u32,
                    bytes: bytes.to_vec(),
                    proof,
                })
            })
            .collect();
        let byte_size = encoded.len() as u64;
        PartSet {
            header: PartSetHeader {
                total: parts.len() as u32,
                hash: root,
            },
            count: parts.len() as u32,
            parts,
            byte_size,
        }
    }

    /// Create an empty set awaiting the parts committed to by `header`.
    pub fn from_header(header: PartSetHeader) -> Self {
        PartSet {
            header,
            parts: vec![None; header.total as usize],
            count: 0,
            byte_size: 0,
        }
    }

    /// The part-set commitment.
    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    /// Whether this set was created for the given commitment.
    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    /// Add a part.
    ///
    /// Returns `true` if the part was added, `false` for duplicates, parts
    /// with an out-of-range index, or parts whose proof does not verify
    /// against the header. None of these are hard errors: bad parts are
    /// simply ignored.
    pub fn add_part(&mut self, part: Part) -> bool {
        let index = part.index as usize;
        if index >= self.parts.len() {
            debug!(index, total = self.header.total, "part index out of range");
            return false;
        }
        if self.parts[index].is_some() {
            return false;
        }
        if !part.proof.verify(&self.header.hash, &part.bytes) {
            debug!(index, "part proof does not verify against header");
            return false;
        }
        self.byte_size += part.bytes.len() as u64;
        self.count += 1;
        self.parts[index] = Some(part);
        true
    }

    /// The part at `index`, if present.
    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)?.as_ref()
    }

    /// Number of parts present.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Total number of parts expected.
    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// Bytes accumulated so far.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Whether every part is present.
    pub fn is_complete(&self) -> bool {
        self.count == self.header.total && self.header.total > 0
    }

    /// Concatenate the parts in index order. `None` until complete.
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut bytes = Vec::with_capacity(self.byte_size as usize);
        for part in self.parts.iter().flatten() {
            bytes.extend_from_slice(&part.bytes);
        }
        Some(bytes)
    }

    /// Decode the assembled block. `None` until complete or if the bytes do
    /// not decode.
    pub fn block(&self) -> Option<Block> {
        let bytes = self.reassemble()?;
        sbor::basic_decode(&bytes).ok()
    }

    /// Iterate over the parts present, in index order.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::{BlockHeader, BlockId, Commit, Hash, KeyPair, Tx};

    fn make_block(payload_size: usize) -> Block {
        let txs = vec![Tx::new("sender", 0, 100, vec![0xAB; payload_size])];
        Block {
            header: BlockHeader {
                chain_id: "test-chain".to_string(),
                height: 1,
                time: 1_700_000_000_000,
                last_block_id: BlockId::nil(),
                last_commit_hash: Hash::ZERO,
                data_hash: Block::compute_data_hash(&txs),
                validators_hash: Hash::from_bytes(b"vals"),
                app_hash: Hash::ZERO,
                proposer_address: KeyPair::from_seed(&[1; 32]).address(),
            },
            txs,
            last_commit: Commit::empty(),
        }
    }

    #[test]
    fn test_split_and_reassemble() {
        // Payload large enough to span several parts.
        let block = make_block(3 * BLOCK_PART_SIZE_BYTES);
        let set = PartSet::from_block(&block);
        assert!(set.total() >= 3);
        assert!(set.is_complete());
        assert_eq!(set.block().unwrap(), block);
    }

    #[test]
    fn test_out_of_order_assembly() {
        let block = make_block(2 * BLOCK_PART_SIZE_BYTES + 17);
        let complete = PartSet::from_block(&block);
        let mut receiving = PartSet::from_header(complete.header());

        // Deliver parts in reverse order.
        let mut parts: Vec<Part> = complete.parts().cloned().collect();
        parts.reverse();
        for part in parts {
            assert!(!receiving.is_complete());
            assert!(receiving.add_part(part));
        }
        assert!(receiving.is_complete());
        assert_eq!(receiving.block().unwrap(), block);
    }

    #[test]
    fn test_duplicate_part_ignored() {
        let block = make_block(100);
        let complete = PartSet::from_block(&block);
        let mut receiving = PartSet::from_header(complete.header());
        let part = complete.get_part(0).unwrap().clone();
        assert!(receiving.add_part(part.clone()));
        assert!(!receiving.add_part(part));
        assert_eq!(receiving.count(), 1);
    }

    #[test]
    fn test_tampered_part_rejected() {
        let block = make_block(100);
        let complete = PartSet::from_block(&block);
        let mut receiving = PartSet::from_header(complete.header());
        let mut part = complete.get_part(0).unwrap().clone();
        part.bytes[0] ^= 0xFF;
        assert!(!receiving.add_part(part));
        assert_eq!(receiving.count(), 0);
        assert_eq!(receiving.byte_size(), 0);
    }

    #[test]
    fn test_wrong_index_rejected() {
        let block = make_block(100);
        let complete = PartSet::from_block(&block);
        let mut receiving = PartSet::from_header(complete.header());
        let mut part = complete.get_part(0).unwrap().clone();
        part.index = 40;
        assert!(!receiving.add_part(part));
    }

    #[test]
    fn test_reassembled_bytes_hash_to_header() {
        let block = make_block(BLOCK_PART_SIZE_BYTES + 5);
        let set = PartSet::from_block(&block);
        let bytes = set.reassemble().unwrap();
        let chunks: Vec<&[u8]> = bytes.chunks(BLOCK_PART_SIZE_BYTES).collect();
        assert_eq!(basalt_types::merkle_root(&chunks), set.header().hash);
    }
}
