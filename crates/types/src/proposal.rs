//! Block proposals.

use crate::{BlockId, Height, Round, Signature, Timestamp};
use sbor::prelude::BasicSbor;

/// A signed proposal for a block at `(height, round)`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Proposal {
    /// Height the proposal applies to.
    pub height: Height,
    /// Round the proposal applies to.
    pub round: Round,
    /// Proof-of-lock round: the round whose polka justifies re-proposing this
    /// block, or -1 when proposing fresh.
    pub pol_round: Round,
    /// The proposed block.
    pub block_id: BlockId,
    /// Proposal time, milliseconds since epoch.
    pub timestamp: Timestamp,
    /// Signature over the canonical proposal bytes.
    pub signature: Signature,
}

impl Proposal {
    /// Create an unsigned proposal.
    pub fn new(
        height: Height,
        round: Round,
        pol_round: Round,
        block_id: BlockId,
        timestamp: Timestamp,
    ) -> Self {
        Proposal {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: Signature::zero(),
        }
    }

    /// Whether the proof-of-lock round is well-formed: -1 or in `[0, round)`.
    pub fn pol_round_valid(&self) -> bool {
        self.pol_round == -1 || (self.pol_round >= 0 && self.pol_round < self.round)
    }
}
