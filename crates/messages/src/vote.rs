//! Vote gossip message.

use basalt_types::{Height, Round, SignedMsgType, Vote};
use sbor::prelude::BasicSbor;

/// A validator's signed prevote or precommit.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct VoteMessage {
    /// The signed vote.
    pub vote: Vote,
}

impl VoteMessage {
    /// Create a new vote message.
    pub fn new(vote: Vote) -> Self {
        VoteMessage { vote }
    }

    /// Height the vote applies to.
    pub fn height(&self) -> Height {
        self.vote.height
    }

    /// Round the vote applies to.
    pub fn round(&self) -> Round {
        self.vote.round
    }

    /// Prevote or precommit.
    pub fn vote_type(&self) -> SignedMsgType {
        self.vote.vote_type
    }
}
