//! Canonical sign-bytes for votes and proposals.
//!
//! Signatures cover a domain tag, the chain id and the canonical encoding of
//! the message. Domain separation keeps a prevote signature from ever being
//! replayable as a precommit or proposal.

use crate::{BlockId, Height, Proposal, Round, SignedMsgType, Timestamp, Vote};
use sbor::prelude::BasicSbor;

/// Domain tag for prevote signatures.
pub const DOMAIN_PREVOTE: &[u8] = b"basalt/prevote";
/// Domain tag for precommit signatures.
pub const DOMAIN_PRECOMMIT: &[u8] = b"basalt/precommit";
/// Domain tag for proposal signatures.
pub const DOMAIN_PROPOSAL: &[u8] = b"basalt/proposal";

/// The signed portion of a vote. Excludes the validator identity; the vote
/// set binds the signature to the validator via its indexed public key.
#[derive(BasicSbor)]
struct CanonicalVote {
    vote_type: SignedMsgType,
    height: Height,
    round: Round,
    block_id: BlockId,
    timestamp: Timestamp,
    chain_id: String,
}

/// The signed portion of a proposal.
#[derive(BasicSbor)]
struct CanonicalProposal {
    height: Height,
    round: Round,
    pol_round: Round,
    block_id: BlockId,
    timestamp: Timestamp,
    chain_id: String,
}

/// Bytes a validator signs for a vote.
pub fn vote_sign_bytes(chain_id: &str, vote: &Vote) -> Vec<u8> {
    let domain = match vote.vote_type {
        SignedMsgType::Prevote => DOMAIN_PREVOTE,
        SignedMsgType::Precommit => DOMAIN_PRECOMMIT,
    };
    let canonical = CanonicalVote {
        vote_type: vote.vote_type,
        height: vote.height,
        round: vote.round,
        block_id: vote.block_id,
        timestamp: vote.timestamp,
        chain_id: chain_id.to_string(),
    };
    let mut bytes = domain.to_vec();
    bytes.extend(sbor::basic_encode(&canonical).expect("canonical vote encoding cannot fail"));
    bytes
}

/// Bytes a validator signs for a proposal.
pub fn proposal_sign_bytes(chain_id: &str, proposal: &Proposal) -> Vec<u8> {
    let canonical = CanonicalProposal {
        height: proposal.height,
        round: proposal.round,
        pol_round: proposal.pol_round,
        block_id: proposal.block_id,
        timestamp: proposal.timestamp,
        chain_id: chain_id.to_string(),
    };
    let mut bytes = DOMAIN_PROPOSAL.to_vec();
    bytes.extend(sbor::basic_encode(&canonical).expect("canonical proposal encoding cannot fail"));
    bytes
}
