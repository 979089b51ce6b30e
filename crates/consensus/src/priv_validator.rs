//! Private validator signing.

use basalt_types::{
    proposal_sign_bytes, vote_sign_bytes, BlockId, Height, KeyPair, Proposal, PublicKey, Round,
    SignedMsgType, Vote,
};
use parking_lot::Mutex;
use thiserror::Error;

/// Why the signer refused to sign.
#[derive(Debug, Error)]
pub enum SignError {
    /// The request regresses on an already-signed `(height, round, step)`.
    #[error("sign request regresses: last signed {last:?}, requested {requested:?}")]
    Regression {
        last: (Height, Round, u8),
        requested: (Height, Round, u8),
    },

    /// Same `(height, round, step)` as the last signature but for a
    /// different block: a double-sign attempt.
    #[error("refusing to double-sign at height {height} round {round}")]
    DoubleSign { height: Height, round: Round },

    /// The signer backend failed or timed out.
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// Signs votes and proposals for this node's validator key.
///
/// Implementations must be monotonic in `(height, round, step)` with steps
/// ordered proposal < prevote < precommit: having signed a precommit for
/// `(h, r)`, a signer refuses a prevote for `(h, r)`.
pub trait PrivValidator: Send + Sync {
    /// The validator public key.
    fn pub_key(&self) -> PublicKey;

    /// Sign a vote in place.
    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError>;

    /// Sign a proposal in place.
    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignError>;
}

/// Sign-step ordinals for monotonicity tracking.
const STEP_PROPOSAL: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;

#[derive(Debug, Clone, Default)]
struct LastSignState {
    height: Height,
    round: Round,
    step: u8,
    block_id: Option<BlockId>,
}

/// An in-process signer holding the key in memory.
pub struct LocalSigner {
    key_pair: KeyPair,
    last: Mutex<LastSignState>,
}

impl LocalSigner {
    /// Create a signer for a key pair.
    pub fn new(key_pair: KeyPair) -> Self {
        LocalSigner {
            key_pair,
            last: Mutex::new(LastSignState::default()),
        }
    }

    /// Check and advance the monotonicity state.
    ///
    /// Re-signing the exact same request (same hrs and block) is allowed so
    /// a retried message can be re-published.
    fn check_hrs(
        &self,
        height: Height,
        round: Round,
        step: u8,
        block_id: &BlockId,
    ) -> Result<(), SignError> {
        let mut last = self.last.lock();
        let last_key = (last.height, last.round, last.step);
        let req_key = (height, round, step);
        if req_key < last_key {
            return Err(SignError::Regression {
                last: last_key,
                requested: req_key,
            });
        }
        if req_key == last_key && last.step != 0 {
            if last.block_id.as_ref() == Some(block_id) {
                return Ok(()); // idempotent re-sign
            }
            return Err(SignError::DoubleSign { height, round });
        }
        last.height = height;
        last.round = round;
        last.step = step;
        last.block_id = Some(*block_id);
        Ok(())
    }
}

impl PrivValidator for LocalSigner {
    fn pub_key(&self) -> PublicKey {
        self.key_pair.public_key()
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError> {
        let step = match vote.vote_type {
            SignedMsgType::Prevote => STEP_PREVOTE,
            SignedMsgType::Precommit => STEP_PRECOMMIT,
        };
        self.check_hrs(vote.height, vote.round, step, &vote.block_id)?;
        vote.signature = self.key_pair.sign(&vote_sign_bytes(chain_id, vote));
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignError> {
        self.check_hrs(
            proposal.height,
            proposal.round,
            STEP_PROPOSAL,
            &proposal.block_id,
        )?;
        proposal.signature = self
            .key_pair
            .sign(&proposal_sign_bytes(chain_id, proposal));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::{Address, Hash, PartSetHeader, Signature};

    fn vote(vote_type: SignedMsgType, height: Height, round: Round, tag: &[u8]) -> Vote {
        Vote {
            vote_type,
            height,
            round,
            block_id: BlockId {
                hash: Hash::from_bytes(tag),
                parts: PartSetHeader::zero(),
            },
            timestamp: 0,
            validator_address: Address::new([0; 20]),
            validator_index: 0,
            signature: Signature::zero(),
            extension: None,
        }
    }

    #[test]
    fn test_signed_vote_verifies() {
        let kp = KeyPair::from_seed(&[5; 32]);
        let signer = LocalSigner::new(kp.clone());
        let mut v = vote(SignedMsgType::Prevote, 1, 0, b"b");
        signer.sign_vote("chain", &mut v).unwrap();
        assert!(kp
            .public_key()
            .verify(&vote_sign_bytes("chain", &v), &v.signature));
    }

    #[test]
    fn test_prevote_after_precommit_refused() {
        let signer = LocalSigner::new(KeyPair::from_seed(&[5; 32]));
        let mut precommit = vote(SignedMsgType::Precommit, 1, 0, b"b");
        signer.sign_vote("chain", &mut precommit).unwrap();

        let mut prevote = vote(SignedMsgType::Prevote, 1, 0, b"b");
        assert!(matches!(
            signer.sign_vote("chain", &mut prevote),
            Err(SignError::Regression { .. })
        ));
    }

    #[test]
    fn test_double_sign_refused() {
        let signer = LocalSigner::new(KeyPair::from_seed(&[5; 32]));
        let mut first = vote(SignedMsgType::Prevote, 1, 0, b"block-a");
        signer.sign_vote("chain", &mut first).unwrap();

        let mut second = vote(SignedMsgType::Prevote, 1, 0, b"block-b");
        assert!(matches!(
            signer.sign_vote("chain", &mut second),
            Err(SignError::DoubleSign { .. })
        ));

        // Re-signing the identical request is fine.
        let mut again = vote(SignedMsgType::Prevote, 1, 0, b"block-a");
        signer.sign_vote("chain", &mut again).unwrap();
    }

    #[test]
    fn test_later_rounds_and_heights_allowed() {
        let signer = LocalSigner::new(KeyPair::from_seed(&[5; 32]));
        let mut v = vote(SignedMsgType::Precommit, 1, 0, b"a");
        signer.sign_vote("chain", &mut v).unwrap();

        let mut next_round = vote(SignedMsgType::Prevote, 1, 1, b"b");
        signer.sign_vote("chain", &mut next_round).unwrap();

        let mut next_height = vote(SignedMsgType::Prevote, 2, 0, b"c");
        signer.sign_vote("chain", &mut next_height).unwrap();
    }

    #[test]
    fn test_proposal_then_votes_in_order() {
        let signer = LocalSigner::new(KeyPair::from_seed(&[5; 32]));
        let mut proposal = Proposal::new(
            1,
            0,
            -1,
            BlockId {
                hash: Hash::from_bytes(b"p"),
                parts: PartSetHeader::zero(),
            },
            0,
        );
        signer.sign_proposal("chain", &mut proposal).unwrap();
        let mut prevote = vote(SignedMsgType::Prevote, 1, 0, b"p");
        signer.sign_vote("chain", &mut prevote).unwrap();
        let mut precommit = vote(SignedMsgType::Precommit, 1, 0, b"p");
        signer.sign_vote("chain", &mut precommit).unwrap();
    }
}
