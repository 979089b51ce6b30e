//! Proposal gossip message.

use basalt_types::{Height, Proposal, Round};
use sbor::prelude::BasicSbor;

/// A proposer's signed block proposal for `(height, round)`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ProposalMessage {
    /// The signed proposal.
    pub proposal: Proposal,
}

impl ProposalMessage {
    /// Create a new proposal message.
    pub fn new(proposal: Proposal) -> Self {
        ProposalMessage { proposal }
    }

    /// Height the proposal applies to.
    pub fn height(&self) -> Height {
        self.proposal.height
    }

    /// Round the proposal applies to.
    pub fn round(&self) -> Round {
        self.proposal.round
    }
}
