//! In-memory state of the current consensus round.

use crate::{HeightVoteSet, PartSet, VoteSet};
use basalt_types::{
    Block, Height, Proposal, Round, Timestamp, ValidatorSet,
};
use std::sync::Arc;

/// The phase of a consensus round.
///
/// `(height, round, step)` totally orders consensus progress, lexicographic
/// with steps in the order listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    /// Waiting for the next height's round 0 to start.
    NewHeight,
    /// A new round has begun.
    NewRound,
    /// Waiting for (or producing) the proposal.
    Propose,
    /// Prevote cast, collecting prevotes.
    Prevote,
    /// 2/3-any prevotes seen, waiting briefly for a polka.
    PrevoteWait,
    /// Precommit cast, collecting precommits.
    Precommit,
    /// 2/3-any precommits seen, waiting briefly for a majority.
    PrecommitWait,
    /// 2/3+ precommits for a block; finalizing.
    Commit,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

/// The mutable state the consensus state machine drives.
///
/// Passive data: mutated exclusively by `ConsensusCore` while the consensus
/// mutex is held, exposed outside only by clone.
#[derive(Debug, Clone)]
pub struct RoundState {
    /// Height we are trying to commit.
    pub height: Height,
    /// Current round within the height.
    pub round: Round,
    /// Current step within the round.
    pub step: Step,
    /// When round 0 of this height starts.
    pub start_time: Timestamp,
    /// The proposal received for this round, if any.
    pub proposal: Option<Proposal>,
    /// The fully assembled proposal block, if complete.
    pub proposal_block: Option<Arc<Block>>,
    /// Parts of the proposal block as they arrive.
    pub proposal_block_parts: Option<PartSet>,
    /// Round we locked in, or -1 if unlocked.
    pub locked_round: Round,
    /// The block we are locked on.
    pub locked_block: Option<Arc<Block>>,
    /// Part set of the locked block.
    pub locked_block_parts: Option<PartSet>,
    /// Round of the most recent polka, or -1.
    pub valid_round: Round,
    /// The most recent polka block: what we re-propose on re-entry.
    pub valid_block: Option<Arc<Block>>,
    /// Part set of the valid block.
    pub valid_block_parts: Option<PartSet>,
    /// All votes for this height, by round and type.
    pub votes: HeightVoteSet,
    /// Round the commit formed in, or -1 before commit.
    pub commit_round: Round,
    /// When the commit formed.
    pub commit_time: Timestamp,
    /// Precommits that committed the previous height.
    pub last_commit: Option<VoteSet>,
    /// Validators for this height.
    pub validators: ValidatorSet,
    /// Validators that signed the previous height.
    pub last_validators: ValidatorSet,
    /// Whether the precommit-wait timeout has been scheduled this round.
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    /// Shorthand `height/round/step` for log lines.
    pub fn hrs(&self) -> String {
        format!("{}/{}/{}", self.height, self.round, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_order_matches_protocol() {
        let order = [
            Step::NewHeight,
            Step::NewRound,
            Step::Propose,
            Step::Prevote,
            Step::PrevoteWait,
            Step::Precommit,
            Step::PrecommitWait,
            Step::Commit,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1], "{} should precede {}", pair[0], pair[1]);
        }
    }
}
