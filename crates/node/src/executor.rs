//! ABCI-backed block executor.
//!
//! Applies finalized blocks to the application:
//! `begin_block` → `deliver_tx` per transaction → `end_block` → `commit`,
//! records the responses, derives the next chain state and persists both.
//! A failed `deliver_tx` is recorded and never aborts the commit.

use crate::{StateStore, StoreError};
use basalt_consensus::BlockExecutor;
use basalt_mempool::TxPool;
use basalt_types::{
    AbciResponses, Application, Block, BlockId, BlockIdFlag, ChainState, Hash, LastCommitInfo,
    VoteInfo,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executes blocks against an [`Application`] and persists the results.
pub struct AbciExecutor {
    app: Arc<dyn Application>,
    store: Arc<dyn StateStore>,
    /// When present, committed transactions are evicted from the pool after
    /// each applied block.
    pool: Option<Arc<TxPool>>,
}

impl AbciExecutor {
    /// Create an executor.
    pub fn new(app: Arc<dyn Application>, store: Arc<dyn StateStore>) -> Self {
        AbciExecutor {
            app,
            store,
            pool: None,
        }
    }

    /// Attach the mempool so committed transactions are removed from it.
    pub fn with_pool(mut self, pool: Arc<TxPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Commit participation summary for `begin_block`, matched against the
    /// validators that signed the previous block.
    fn last_commit_info(state: &ChainState, block: &Block) -> LastCommitInfo {
        let votes = state
            .last_validators
            .validators()
            .iter()
            .map(|v| {
                let signed = block.last_commit.signatures.iter().any(|sig| {
                    sig.validator_address == v.address && !matches!(sig.flag, BlockIdFlag::Absent)
                });
                VoteInfo {
                    validator_address: v.address,
                    voting_power: v.voting_power,
                    signed_last_block: signed,
                }
            })
            .collect();
        LastCommitInfo {
            round: block.last_commit.round,
            votes,
        }
    }
}

impl BlockExecutor for AbciExecutor {
    fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), String> {
        block.validate_basic()?;
        if block.header.chain_id != state.chain_id {
            return Err(format!(
                "wrong chain id {} (expected {})",
                block.header.chain_id, state.chain_id
            ));
        }
        let expected_height = if state.last_block_height == 0 {
            state.initial_height
        } else {
            state.last_block_height + 1
        };
        if block.header.height != expected_height {
            return Err(format!(
                "wrong height {} (expected {expected_height})",
                block.header.height
            ));
        }
        if state.last_block_height > 0 {
            if block.header.time <= state.last_block_time {
                return Err("block time does not advance".to_string());
            }
            if block.header.last_block_id != state.last_block_id {
                return Err("last block id mismatch".to_string());
            }
        }
        if block.header.app_hash != state.app_hash {
            return Err(format!(
                "app hash mismatch: header has {}, state has {}",
                block.header.app_hash, state.app_hash
            ));
        }
        if block.header.validators_hash != state.validators.hash() {
            return Err("validators hash mismatch".to_string());
        }
        Ok(())
    }

    fn apply_block(
        &self,
        state: &ChainState,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<ChainState, String> {
        let height = block.header.height;
        let last_commit_info = Self::last_commit_info(state, block);

        let begin_block = self.app.begin_block(&block.header, &last_commit_info, &[]);

        let mut deliver_txs = Vec::with_capacity(block.txs.len());
        let mut failed = 0usize;
        for tx in &block.txs {
            let response = self.app.deliver_tx(tx);
            if !response.is_ok() {
                // Recorded, not fatal: the block still commits.
                failed += 1;
                debug!(height, code = response.code, "deliver_tx failed");
            }
            deliver_txs.push(response);
        }
        if failed > 0 {
            warn!(height, failed, total = block.txs.len(), "some transactions failed to apply");
        }

        let end_block = self.app.end_block(height);
        let app_hash = self.app.commit();

        let responses = AbciResponses {
            deliver_txs,
            begin_block,
            end_block: end_block.clone(),
        };

        // Validator updates take effect two heights after this block.
        let mut next_validators = state.next_validators.clone();
        let mut last_height_validators_changed = state.last_height_validators_changed;
        if !end_block.validator_updates.is_empty() {
            next_validators.apply_updates(&end_block.validator_updates);
            last_height_validators_changed = height + 2;
            info!(
                height,
                updates = end_block.validator_updates.len(),
                "validator set updated"
            );
        }

        let mut consensus_params = state.consensus_params;
        let mut last_height_consensus_params_changed = state.last_height_consensus_params_changed;
        if let Some(updates) = end_block.consensus_param_updates {
            consensus_params = updates;
            last_height_consensus_params_changed = height + 1;
        }

        // The set that validated this block becomes last_validators; the
        // pre-announced next set takes over with its rotation advanced.
        let mut validators = state.next_validators.clone();
        validators.increment_proposer_priority(1);

        let new_state = ChainState {
            chain_id: state.chain_id.clone(),
            initial_height: state.initial_height,
            last_block_height: height,
            last_block_id: *block_id,
            last_block_time: block.header.time,
            validators,
            next_validators,
            last_validators: state.validators.clone(),
            last_height_validators_changed,
            consensus_params,
            last_height_consensus_params_changed,
            app_hash,
            last_results_hash: results_hash(&responses),
        };

        self.store
            .save(&new_state)
            .map_err(|e: StoreError| e.to_string())?;
        self.store
            .save_abci_responses(height, &responses)
            .map_err(|e| e.to_string())?;

        if let Some(pool) = &self.pool {
            let committed: Vec<_> = block.txs.iter().map(|tx| tx.id()).collect();
            pool.update(&committed);
        }

        Ok(new_state)
    }
}

fn results_hash(responses: &AbciResponses) -> Hash {
    let encoded = sbor::basic_encode(responses).expect("responses encoding cannot fail");
    Hash::from_bytes(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RocksStateStore;
    use basalt_types::{
        Address, BlockHeader, Commit, ConsensusParams, Height, KeyPair, PublicKey,
        ResponseBeginBlock, ResponseCheckTx, ResponseDeliverTx, ResponseEndBlock, Tx, Validator,
        ValidatorSet, ValidatorUpdate,
    };
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts commits; rejects txs whose payload starts with 0xFF.
    struct CountingApp {
        commits: AtomicU64,
        validator_update: Option<ValidatorUpdate>,
    }

    impl Application for CountingApp {
        fn check_tx(&self, _tx: &Tx) -> ResponseCheckTx {
            ResponseCheckTx::default()
        }

        fn begin_block(
            &self,
            _header: &BlockHeader,
            _last_commit: &LastCommitInfo,
            _byzantine_validators: &[Address],
        ) -> ResponseBeginBlock {
            ResponseBeginBlock::default()
        }

        fn deliver_tx(&self, tx: &Tx) -> ResponseDeliverTx {
            ResponseDeliverTx {
                code: if tx.payload.first() == Some(&0xFF) { 1 } else { 0 },
                ..Default::default()
            }
        }

        fn end_block(&self, _height: Height) -> ResponseEndBlock {
            ResponseEndBlock {
                validator_updates: self.validator_update.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn commit(&self) -> Hash {
            let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
            Hash::from_bytes(&n.to_le_bytes())
        }
    }

    fn validators(n: u8) -> ValidatorSet {
        ValidatorSet::new(
            (0..n)
                .map(|i| Validator::new(KeyPair::from_seed(&[i + 1; 32]).public_key(), 10))
                .collect(),
        )
    }

    fn genesis() -> ChainState {
        ChainState::new_genesis("exec-chain", 1, validators(4), ConsensusParams::default())
    }

    fn make_block(state: &ChainState, txs: Vec<Tx>) -> (Block, BlockId) {
        let block = Block {
            header: BlockHeader {
                chain_id: state.chain_id.clone(),
                height: if state.last_block_height == 0 {
                    state.initial_height
                } else {
                    state.last_block_height + 1
                },
                time: state.last_block_time + 1000,
                last_block_id: state.last_block_id,
                last_commit_hash: Hash::ZERO,
                data_hash: Block::compute_data_hash(&txs),
                validators_hash: state.validators.hash(),
                app_hash: state.app_hash,
                proposer_address: Address::new([1; 20]),
            },
            txs,
            last_commit: Commit::empty(),
        };
        let block_id = BlockId {
            hash: block.hash(),
            parts: basalt_types::PartSetHeader {
                total: 1,
                hash: Hash::from_bytes(b"parts"),
            },
        };
        (block, block_id)
    }

    fn make_executor(
        update: Option<ValidatorUpdate>,
    ) -> (AbciExecutor, Arc<dyn StateStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(RocksStateStore::open(dir.path()).unwrap());
        let app = Arc::new(CountingApp {
            commits: AtomicU64::new(0),
            validator_update: update,
        });
        (AbciExecutor::new(app, Arc::clone(&store)), store, dir)
    }

    #[test]
    fn test_apply_block_advances_state() {
        let (executor, store, _dir) = make_executor(None);
        let state = genesis();
        let txs = vec![Tx::new("alice", 0, 10, b"ok".to_vec())];
        let (block, block_id) = make_block(&state, txs);

        executor.validate_block(&state, &block).unwrap();
        let new_state = executor.apply_block(&state, &block_id, &block).unwrap();

        assert_eq!(new_state.last_block_height, 1);
        assert_eq!(new_state.last_block_id, block_id);
        assert_ne!(new_state.app_hash, state.app_hash);
        assert_eq!(new_state.last_validators, state.validators);

        // Both the state and the responses were persisted.
        assert_eq!(store.load_state().unwrap().unwrap(), new_state);
        let responses = store.load_abci_responses(1).unwrap().unwrap();
        assert_eq!(responses.deliver_txs.len(), 1);
        assert!(responses.deliver_txs[0].is_ok());
    }

    #[test]
    fn test_failed_deliver_tx_recorded_not_fatal() {
        let (executor, store, _dir) = make_executor(None);
        let state = genesis();
        let txs = vec![
            Tx::new("alice", 0, 10, b"ok".to_vec()),
            Tx::new("bob", 0, 10, vec![0xFF, 1, 2]),
        ];
        let (block, block_id) = make_block(&state, txs);

        let new_state = executor.apply_block(&state, &block_id, &block).unwrap();
        assert_eq!(new_state.last_block_height, 1, "block commits despite the failure");

        let responses = store.load_abci_responses(1).unwrap().unwrap();
        assert!(responses.deliver_txs[0].is_ok());
        assert!(!responses.deliver_txs[1].is_ok());
    }

    #[test]
    fn test_validator_updates_land_in_next_validators() {
        let newcomer = KeyPair::from_seed(&[99; 32]).public_key();
        let (executor, _store, _dir) = make_executor(Some(ValidatorUpdate {
            pub_key: newcomer,
            power: 7,
        }));
        let state = genesis();
        let (block, block_id) = make_block(&state, vec![]);

        let new_state = executor.apply_block(&state, &block_id, &block).unwrap();
        // The update applies two heights out: current validators unchanged,
        // next_validators include the newcomer.
        assert_eq!(new_state.validators.len(), 4);
        assert_eq!(new_state.next_validators.len(), 5);
        assert!(new_state.next_validators.has_address(&newcomer.address()));
        assert_eq!(new_state.last_height_validators_changed, 3);
    }

    #[test]
    fn test_validate_block_rejects_wrong_height_and_chain() {
        let (executor, _store, _dir) = make_executor(None);
        let state = genesis();
        let (mut block, _) = make_block(&state, vec![]);

        block.header.height = 9;
        assert!(executor.validate_block(&state, &block).is_err());

        let (mut block, _) = make_block(&state, vec![]);
        block.header.chain_id = "other-chain".to_string();
        assert!(executor.validate_block(&state, &block).is_err());

        let (mut block, _) = make_block(&state, vec![]);
        block.header.app_hash = Hash::from_bytes(b"wrong");
        assert!(executor.validate_block(&state, &block).is_err());
    }

    #[test]
    fn test_public_key_address_stability() {
        // Guard against validator identity drift between runs.
        let pk = PublicKey::new(*KeyPair::from_seed(&[1; 32]).public_key().as_bytes());
        assert_eq!(pk.address(), KeyPair::from_seed(&[1; 32]).address());
    }
}
