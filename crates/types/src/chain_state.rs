//! Replicated chain state.

use crate::{
    BlockId, ConsensusParams, Hash, Height, Timestamp, ValidatorSet,
};
use sbor::prelude::BasicSbor;

/// The state the consensus engine carries between heights: everything needed
/// to validate and finalize the next block.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ChainState {
    /// Chain identifier, part of every signature.
    pub chain_id: String,
    /// First height of this chain.
    pub initial_height: Height,
    /// Height of the last committed block; 0 before the first commit.
    pub last_block_height: Height,
    /// Id of the last committed block.
    pub last_block_id: BlockId,
    /// BFT time of the last committed block.
    pub last_block_time: Timestamp,
    /// Validators for the next block.
    pub validators: ValidatorSet,
    /// Validators for the block after next, already reflecting pending
    /// updates from the application.
    pub next_validators: ValidatorSet,
    /// Validators that signed the last committed block.
    pub last_validators: ValidatorSet,
    /// Height at which `validators` last changed.
    pub last_height_validators_changed: Height,
    /// Active consensus parameters.
    pub consensus_params: ConsensusParams,
    /// Height at which `consensus_params` last changed.
    pub last_height_consensus_params_changed: Height,
    /// Application hash after the last committed block.
    pub app_hash: Hash,
    /// Hash over the ABCI results of the last committed block.
    pub last_results_hash: Hash,
}

impl ChainState {
    /// Genesis state for a fresh chain.
    pub fn new_genesis(
        chain_id: impl Into<String>,
        initial_height: Height,
        validators: ValidatorSet,
        consensus_params: ConsensusParams,
    ) -> Self {
        ChainState {
            chain_id: chain_id.into(),
            initial_height,
            last_block_height: 0,
            last_block_id: BlockId::nil(),
            last_block_time: 0,
            next_validators: validators.clone(),
            last_validators: ValidatorSet::new(Vec::new()),
            validators,
            last_height_validators_changed: initial_height,
            consensus_params,
            last_height_consensus_params_changed: initial_height,
            app_hash: Hash::ZERO,
            last_results_hash: Hash::ZERO,
        }
    }

    /// A sentinel unpopulated state.
    pub fn empty() -> Self {
        ChainState::new_genesis("", 1, ValidatorSet::new(Vec::new()), ConsensusParams::default())
    }

    /// Whether this state has been populated at all.
    pub fn is_empty(&self) -> bool {
        self.chain_id.is_empty() && self.validators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyPair, Validator};

    fn genesis() -> ChainState {
        let validators = ValidatorSet::new(
            (0..4)
                .map(|i| Validator::new(KeyPair::from_seed(&[i + 1; 32]).public_key(), 10))
                .collect(),
        );
        ChainState::new_genesis("test-chain", 1, validators, ConsensusParams::default())
    }

    #[test]
    fn test_genesis_shape() {
        let state = genesis();
        assert_eq!(state.last_block_height, 0);
        assert!(state.last_block_id.is_nil());
        assert_eq!(state.validators, state.next_validators);
        assert!(state.last_validators.is_empty());
        assert!(!state.is_empty());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let state = genesis();
        let encoded = sbor::basic_encode(&state).unwrap();
        let decoded: ChainState = sbor::basic_decode(&encoded).unwrap();
        assert_eq!(state, decoded);
    }
}
