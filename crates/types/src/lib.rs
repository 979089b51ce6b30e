//! Core types for Basalt consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, cryptographic keys and signatures, merkle proofs
//! - **Consensus types**: Block, BlockId, Vote, Commit, Proposal, ValidatorSet
//! - **Mempool types**: Tx
//! - **Application interface**: ABCI-style request/response types
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod abci;
mod block;
mod chain_state;
mod crypto;
mod hash;
mod merkle;
mod params;
mod proposal;
mod signing;
mod transaction;
mod validator;
mod vote;

pub use abci::{
    AbciResponses, Application, Event, EventAttribute, LastCommitInfo, ResponseBeginBlock,
    ResponseCheckTx, ResponseDeliverTx, ResponseEndBlock, ValidatorUpdate, VoteInfo, CODE_OK,
};
pub use block::{Block, BlockHeader, BlockId, Part, PartSetHeader};
pub use chain_state::ChainState;
pub use crypto::{Address, KeyPair, PublicKey, Signature};
pub use hash::Hash;
pub use merkle::{merkle_proofs, merkle_root, MerkleProof};
pub use params::{BlockParams, ConsensusParams};
pub use proposal::Proposal;
pub use signing::{
    proposal_sign_bytes, vote_sign_bytes, DOMAIN_PRECOMMIT, DOMAIN_PREVOTE, DOMAIN_PROPOSAL,
};
pub use transaction::{Tx, TxId};
pub use validator::{Validator, ValidatorSet};
pub use vote::{BlockIdFlag, Commit, CommitSig, SignedMsgType, Vote};

/// Block height. Heights start at `initial_height` and increase by one per
/// committed block.
pub type Height = i64;

/// Round number within a height. Resets to 0 on a new height.
pub type Round = i32;

/// Wall-clock timestamp, milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
