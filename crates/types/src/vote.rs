//! Votes and commits.

use crate::{Address, BlockId, Height, Round, Signature, Timestamp};
use sbor::prelude::BasicSbor;

/// The two vote types of the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub enum SignedMsgType {
    /// First-phase vote on a proposal.
    Prevote,
    /// Second-phase vote, cast after a polka.
    Precommit,
}

impl std::fmt::Display for SignedMsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignedMsgType::Prevote => write!(f, "prevote"),
            SignedMsgType::Precommit => write!(f, "precommit"),
        }
    }
}

/// A signed vote from a validator for a block (or nil) at `(height, round)`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Vote {
    /// Prevote or precommit.
    pub vote_type: SignedMsgType,
    /// Height the vote applies to.
    pub height: Height,
    /// Round the vote applies to.
    pub round: Round,
    /// Voted block, or the nil block id.
    pub block_id: BlockId,
    /// BFT time claimed by the voter, milliseconds since epoch.
    pub timestamp: Timestamp,
    /// Address of the voting validator.
    pub validator_address: Address,
    /// Index of the validator in the active set.
    pub validator_index: i32,
    /// Signature over the canonical vote bytes.
    pub signature: Signature,
    /// Optional application-supplied vote extension (precommits only).
    pub extension: Option<Vec<u8>>,
}

impl Vote {
    /// Whether this vote is for nil rather than a concrete block.
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }
}

/// How a validator participated in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub enum BlockIdFlag {
    /// No precommit received from this validator.
    Absent,
    /// Precommit for the committed block.
    Commit,
    /// Precommit for nil.
    Nil,
}

/// One validator's entry in a [`Commit`].
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct CommitSig {
    /// Participation flag.
    pub flag: BlockIdFlag,
    /// Validator address; meaningful unless `flag` is `Absent`.
    pub validator_address: Address,
    /// Vote timestamp.
    pub timestamp: Timestamp,
    /// Vote signature; zero when absent.
    pub signature: Signature,
}

impl CommitSig {
    /// An absent entry for a validator that did not precommit.
    pub fn absent() -> Self {
        CommitSig {
            flag: BlockIdFlag::Absent,
            validator_address: Address::new([0u8; 20]),
            timestamp: 0,
            signature: Signature::zero(),
        }
    }
}

/// The 2/3+ precommit evidence that finalized a block, carried in the next
/// block so late joiners can verify the chain.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Commit {
    /// Committed height.
    pub height: Height,
    /// Round in which the commit formed.
    pub round: Round,
    /// The committed block id.
    pub block_id: BlockId,
    /// One entry per validator, in validator-set order.
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// The empty commit preceding the initial height.
    pub fn empty() -> Self {
        Commit {
            height: 0,
            round: 0,
            block_id: BlockId::nil(),
            signatures: Vec::new(),
        }
    }

    /// Number of non-absent signatures.
    pub fn num_signed(&self) -> usize {
        self.signatures
            .iter()
            .filter(|s| !matches!(s.flag, BlockIdFlag::Absent))
            .count()
    }
}
