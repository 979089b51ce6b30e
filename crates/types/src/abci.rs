//! Application interface.
//!
//! The consensus core drives a replicated application through these ABCI-style
//! callbacks: `check_tx` for mempool admission and the
//! `begin_block`/`deliver_tx`/`end_block`/`commit` cycle when a block
//! finalizes.

use crate::{Address, BlockHeader, ConsensusParams, Hash, Height, PublicKey, Round, Tx};
use sbor::prelude::BasicSbor;

/// Response code signalling success.
pub const CODE_OK: u32 = 0;

/// A key/value attribute attached to an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
    /// Whether the attribute should be indexed by event stores.
    pub index: bool,
}

/// A typed application event emitted while processing a block or transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

/// A validator power change requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct ValidatorUpdate {
    /// Public key of the validator to add or update.
    pub pub_key: PublicKey,
    /// New voting power; 0 removes the validator.
    pub power: i64,
}

/// Admission decision for a candidate transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct ResponseCheckTx {
    /// 0 accepts the transaction; anything else rejects.
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub gas_wanted: i64,
    pub gas_used: i64,
    pub events: Vec<Event>,
}

impl ResponseCheckTx {
    /// Whether the application accepted the transaction.
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Result of applying one transaction in a committed block.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct ResponseDeliverTx {
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub gas_wanted: i64,
    pub gas_used: i64,
    pub events: Vec<Event>,
}

impl ResponseDeliverTx {
    /// Whether the transaction applied successfully.
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Response to `begin_block`.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct ResponseBeginBlock {
    pub events: Vec<Event>,
}

/// Response to `end_block`.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct ResponseEndBlock {
    /// Validator set changes to apply at height + 2.
    pub validator_updates: Vec<ValidatorUpdate>,
    /// Updated consensus parameters, if any.
    pub consensus_param_updates: Option<ConsensusParams>,
    pub events: Vec<Event>,
}

impl Default for ValidatorUpdate {
    fn default() -> Self {
        ValidatorUpdate {
            pub_key: PublicKey::new([0u8; 32]),
            power: 0,
        }
    }
}

/// Everything the application returned while a block was applied. Persisted
/// per height; a failed `deliver_tx` is recorded here, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct AbciResponses {
    pub deliver_txs: Vec<ResponseDeliverTx>,
    pub begin_block: ResponseBeginBlock,
    pub end_block: ResponseEndBlock,
}

/// How one validator participated in the last commit.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct VoteInfo {
    pub validator_address: Address,
    pub voting_power: i64,
    pub signed_last_block: bool,
}

/// Commit participation summary handed to `begin_block`.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct LastCommitInfo {
    pub round: Round,
    pub votes: Vec<VoteInfo>,
}

/// The replicated application driven by consensus.
///
/// Implementations must be safe to call from multiple threads: `check_tx`
/// runs concurrently from mempool ingress while the block cycle runs from the
/// consensus worker.
pub trait Application: Send + Sync {
    /// Admission check for a candidate transaction.
    fn check_tx(&self, tx: &Tx) -> ResponseCheckTx;

    /// Signals the start of a new block.
    fn begin_block(
        &self,
        header: &BlockHeader,
        last_commit: &LastCommitInfo,
        byzantine_validators: &[Address],
    ) -> ResponseBeginBlock;

    /// Applies one transaction of the committed block.
    fn deliver_tx(&self, tx: &Tx) -> ResponseDeliverTx;

    /// Signals the end of the block; may update validators and parameters.
    fn end_block(&self, height: Height) -> ResponseEndBlock;

    /// Commits the application state, returning the new app hash.
    fn commit(&self) -> Hash;
}
