//! Consensus parameters.

use sbor::prelude::BasicSbor;

/// Limits on block contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct BlockParams {
    /// Maximum encoded block size in bytes.
    pub max_bytes: u64,
    /// Maximum total gas of transactions in a block; -1 means unlimited.
    pub max_gas: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        BlockParams {
            max_bytes: 4 * 1024 * 1024,
            max_gas: -1,
        }
    }
}

/// Chain-wide consensus parameters, updatable by the application through
/// `end_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BasicSbor)]
pub struct ConsensusParams {
    /// Block limits.
    pub block: BlockParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = ConsensusParams::default();
        assert_eq!(params.block.max_bytes, 4 * 1024 * 1024);
        assert_eq!(params.block.max_gas, -1);
    }
}
