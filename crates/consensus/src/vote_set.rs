//! Vote tallying.
//!
//! A [`VoteSet`] collects signed votes for one `(height, round, type)` and
//! tracks when 2/3+ of the voting power agrees on a single block id (a
//! majority) or has voted at all (2/3-any). A [`HeightVoteSet`] owns the
//! prevote and precommit sets for every round of one height.

use basalt_types::{
    vote_sign_bytes, BlockId, BlockIdFlag, Commit, CommitSig, Height, Round, SignedMsgType,
    ValidatorSet, Vote,
};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

/// Why a vote was not added.
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("vote height {got} does not match vote set height {expected}")]
    WrongHeight { expected: Height, got: Height },

    #[error("vote round {got} does not match vote set round {expected}")]
    WrongRound { expected: Round, got: Round },

    #[error("vote type {got} does not match vote set type {expected}")]
    WrongType {
        expected: SignedMsgType,
        got: SignedMsgType,
    },

    #[error("validator index {0} out of range")]
    UnknownValidator(i32),

    #[error("vote address does not match validator at index {0}")]
    AddressMismatch(i32),

    #[error("invalid signature")]
    InvalidSignature,

    /// Same validator, same `(height, round, type)`, different block id.
    /// The previously stored vote is retained; the pair is double-sign
    /// evidence.
    #[error("conflicting vote from validator index {}", existing.validator_index)]
    Conflicting {
        /// The vote already stored for this validator.
        existing: Box<Vote>,
    },
}

/// Tally of signed votes for one `(height, round, type)`.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: Height,
    round: Round,
    vote_type: SignedMsgType,
    validators: ValidatorSet,
    /// First-seen vote per validator, indexed like the validator set.
    votes: Vec<Option<Vote>>,
    /// Aggregated voting power per block id (nil included).
    power_by_block: HashMap<BlockId, i64>,
    /// Total power that has voted, regardless of block id.
    sum: i64,
    /// First block id to cross 2/3 of the total power, if any.
    maj23: Option<BlockId>,
}

impl VoteSet {
    /// Create an empty vote set.
    pub fn new(
        chain_id: impl Into<String>,
        height: Height,
        round: Round,
        vote_type: SignedMsgType,
        validators: ValidatorSet,
    ) -> Self {
        let n = validators.len();
        VoteSet {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; n],
            power_by_block: HashMap::new(),
            sum: 0,
            maj23: None,
        }
    }

    /// Height this set tallies.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Round this set tallies.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Vote type this set tallies.
    pub fn vote_type(&self) -> SignedMsgType {
        self.vote_type
    }

    /// Add a signed vote.
    ///
    /// Returns `Ok(true)` if the vote was stored, `Ok(false)` if it was an
    /// exact duplicate of the stored vote. A different-block vote from a
    /// validator that already voted is rejected as [`VoteError::Conflicting`]
    /// without overwriting the stored vote.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteError> {
        if vote.height != self.height {
            return Err(VoteError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteError::WrongRound {
                expected: self.round,
                got: vote.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteError::WrongType {
                expected: self.vote_type,
                got: vote.vote_type,
            });
        }

        let index = vote.validator_index;
        let validator = self
            .validators
            .get_by_index(index)
            .ok_or(VoteError::UnknownValidator(index))?;
        if validator.address != vote.validator_address {
            return Err(VoteError::AddressMismatch(index));
        }

        let sign_bytes = vote_sign_bytes(&self.chain_id, &vote);
        if !validator.pub_key.verify(&sign_bytes, &vote.signature) {
            return Err(VoteError::InvalidSignature);
        }

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id {
                return Ok(false);
            }
            return Err(VoteError::Conflicting {
                existing: Box::new(existing.clone()),
            });
        }

        let power = validator.voting_power;
        let block_power = self.power_by_block.entry(vote.block_id).or_insert(0);
        *block_power += power;
        self.sum += power;
        if self.maj23.is_none() && self.validators.has_two_thirds(*block_power) {
            self.maj23 = Some(vote.block_id);
        }
        self.votes[index as usize] = Some(vote);
        Ok(true)
    }

    /// The block id (possibly nil) that gathered 2/3+ of the power, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// Whether some block id has a 2/3+ majority.
    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Whether 2/3+ of the power has voted for anything at all.
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.has_two_thirds(self.sum)
    }

    /// Whether every validator has voted.
    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    /// Number of stored votes.
    pub fn count(&self) -> usize {
        self.votes.iter().filter(|v| v.is_some()).count()
    }

    /// The stored vote for a validator index.
    pub fn get_by_index(&self, index: i32) -> Option<&Vote> {
        if index < 0 {
            return None;
        }
        self.votes.get(index as usize)?.as_ref()
    }

    /// All stored votes.
    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }

    /// Build a [`Commit`] from a precommit set with a non-nil majority.
    ///
    /// Returns `None` when this is not a precommit set or no block majority
    /// exists.
    pub fn make_commit(&self) -> Option<Commit> {
        if self.vote_type != SignedMsgType::Precommit {
            return None;
        }
        let block_id = self.maj23.filter(|bid| !bid.is_nil())?;
        let signatures = self
            .votes
            .iter()
            .map(|slot| match slot {
                Some(vote) if vote.block_id == block_id => CommitSig {
                    flag: BlockIdFlag::Commit,
                    validator_address: vote.validator_address,
                    timestamp: vote.timestamp,
                    signature: vote.signature,
                },
                Some(vote) if vote.is_nil() => CommitSig {
                    flag: BlockIdFlag::Nil,
                    validator_address: vote.validator_address,
                    timestamp: vote.timestamp,
                    signature: vote.signature,
                },
                _ => CommitSig::absent(),
            })
            .collect();
        Some(Commit {
            height: self.height,
            round: self.round,
            block_id,
            signatures,
        })
    }
}

/// Prevote and precommit sets for one round.
#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// All votes observed for one height, organized by round and type.
///
/// Rounds are created lazily; a vote for a round we have not entered yet is
/// still admitted, since 2/3-any for a future round triggers a round skip.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: String,
    height: Height,
    validators: ValidatorSet,
    /// The highest round allocated so far.
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
}

impl HeightVoteSet {
    /// Create the vote sets for a height, with round 0 allocated.
    pub fn new(chain_id: impl Into<String>, height: Height, validators: ValidatorSet) -> Self {
        let mut hvs = HeightVoteSet {
            chain_id: chain_id.into(),
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
        };
        hvs.ensure_round(0);
        hvs
    }

    /// Height these sets tally.
    pub fn height(&self) -> Height {
        self.height
    }

    /// The highest round allocated so far.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Allocate vote sets for every round in `[0, round]`.
    pub fn set_round(&mut self, round: Round) {
        for r in 0..=round.max(0) {
            self.ensure_round(r);
        }
        self.round = self.round.max(round);
    }

    fn ensure_round(&mut self, round: Round) {
        if !self.round_vote_sets.contains_key(&round) {
            let rvs = RoundVoteSet {
                prevotes: VoteSet::new(
                    self.chain_id.clone(),
                    self.height,
                    round,
                    SignedMsgType::Prevote,
                    self.validators.clone(),
                ),
                precommits: VoteSet::new(
                    self.chain_id.clone(),
                    self.height,
                    round,
                    SignedMsgType::Precommit,
                    self.validators.clone(),
                ),
            };
            self.round_vote_sets.insert(round, rvs);
        }
        self.round = self.round.max(round);
    }

    /// Route a vote into the matching set, allocating its round if needed.
    pub fn add_vote(&mut self, vote: Vote, peer_id: &str) -> Result<bool, VoteError> {
        if vote.height != self.height {
            return Err(VoteError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        let round = vote.round;
        self.ensure_round(round);
        let set = match vote.vote_type {
            SignedMsgType::Prevote => &mut self.round_vote_sets.get_mut(&round).unwrap().prevotes,
            SignedMsgType::Precommit => {
                &mut self.round_vote_sets.get_mut(&round).unwrap().precommits
            }
        };
        let result = set.add_vote(vote);
        if let Err(err) = &result {
            debug!(height = self.height, round, peer_id, %err, "vote not added");
        }
        result
    }

    /// The prevote set for a round, allocating if absent.
    pub fn prevotes(&mut self, round: Round) -> &mut VoteSet {
        self.ensure_round(round);
        &mut self.round_vote_sets.get_mut(&round).unwrap().prevotes
    }

    /// The precommit set for a round, allocating if absent.
    pub fn precommits(&mut self, round: Round) -> &mut VoteSet {
        self.ensure_round(round);
        &mut self.round_vote_sets.get_mut(&round).unwrap().precommits
    }

    /// The highest round with a prevote polka for a non-nil block, or -1.
    pub fn pol_info(&self) -> Round {
        self.round_vote_sets
            .iter()
            .rev()
            .find(|(_, rvs)| {
                rvs.prevotes
                    .two_thirds_majority()
                    .is_some_and(|bid| !bid.is_nil())
            })
            .map(|(r, _)| *r)
            .unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::{
        Address, BlockId, Hash, KeyPair, PartSetHeader, Signature, Validator,
    };

    const CHAIN: &str = "test-chain";

    fn keypairs(n: u8) -> Vec<KeyPair> {
        (0..n).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect()
    }

    fn validator_set(keys: &[KeyPair]) -> ValidatorSet {
        ValidatorSet::new(
            keys.iter()
                .map(|kp| Validator::new(kp.public_key(), 10))
                .collect(),
        )
    }

    fn block_id(tag: &[u8]) -> BlockId {
        BlockId {
            hash: Hash::from_bytes(tag),
            parts: PartSetHeader {
                total: 1,
                hash: Hash::from_bytes(tag),
            },
        }
    }

    fn signed_vote(
        keys: &[KeyPair],
        validators: &ValidatorSet,
        key_idx: usize,
        vote_type: SignedMsgType,
        round: Round,
        bid: BlockId,
    ) -> Vote {
        let kp = &keys[key_idx];
        let (index, _) = validators.get_by_address(&kp.address()).unwrap();
        let mut vote = Vote {
            vote_type,
            height: 1,
            round,
            block_id: bid,
            timestamp: 1000 + key_idx as u64,
            validator_address: kp.address(),
            validator_index: index,
            signature: Signature::zero(),
            extension: None,
        };
        vote.signature = kp.sign(&vote_sign_bytes(CHAIN, &vote));
        vote
    }

    #[test]
    fn test_majority_forms_at_two_thirds() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Prevote, vals.clone());
        let bid = block_id(b"block-a");

        for i in 0..2 {
            set.add_vote(signed_vote(&keys, &vals, i, SignedMsgType::Prevote, 0, bid))
                .unwrap();
            assert!(set.two_thirds_majority().is_none());
        }
        set.add_vote(signed_vote(&keys, &vals, 2, SignedMsgType::Prevote, 0, bid))
            .unwrap();
        assert_eq!(set.two_thirds_majority(), Some(bid));
        assert!(set.has_two_thirds_any());
        assert!(!set.has_all());
    }

    #[test]
    fn test_nil_majority() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Prevote, vals.clone());
        for i in 0..3 {
            set.add_vote(signed_vote(
                &keys,
                &vals,
                i,
                SignedMsgType::Prevote,
                0,
                BlockId::nil(),
            ))
            .unwrap();
        }
        let maj = set.two_thirds_majority().unwrap();
        assert!(maj.is_nil());
    }

    #[test]
    fn test_split_votes_no_majority() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Prevote, vals.clone());
        set.add_vote(signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, block_id(b"a")))
            .unwrap();
        set.add_vote(signed_vote(&keys, &vals, 1, SignedMsgType::Prevote, 0, block_id(b"b")))
            .unwrap();
        set.add_vote(signed_vote(&keys, &vals, 2, SignedMsgType::Prevote, 0, BlockId::nil()))
            .unwrap();
        assert!(set.two_thirds_majority().is_none());
        // 30 of 40 power voted for *something*.
        assert!(set.has_two_thirds_any());
    }

    #[test]
    fn test_duplicate_vote_not_double_counted() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Prevote, vals.clone());
        let vote = signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, block_id(b"a"));
        assert!(set.add_vote(vote.clone()).unwrap());
        assert!(!set.add_vote(vote).unwrap());
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_conflicting_vote_keeps_original() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Prevote, vals.clone());
        let first = signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, block_id(b"a"));
        set.add_vote(first.clone()).unwrap();

        let conflicting = signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, block_id(b"b"));
        match set.add_vote(conflicting) {
            Err(VoteError::Conflicting { existing }) => {
                assert_eq!(existing.block_id, first.block_id);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // Stored vote unchanged.
        assert_eq!(
            set.get_by_index(first.validator_index).unwrap().block_id,
            first.block_id
        );
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Prevote, vals.clone());
        let mut vote = signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, block_id(b"a"));
        vote.round = 0;
        vote.timestamp += 1; // invalidates the signature
        assert!(matches!(
            set.add_vote(vote),
            Err(VoteError::InvalidSignature)
        ));
    }

    #[test]
    fn test_unknown_validator_rejected() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Prevote, vals.clone());
        let mut vote = signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, block_id(b"a"));
        vote.validator_index = 17;
        assert!(matches!(
            set.add_vote(vote),
            Err(VoteError::UnknownValidator(17))
        ));

        let mut vote = signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, block_id(b"a"));
        vote.validator_address = Address::new([9; 20]);
        assert!(matches!(
            set.add_vote(vote),
            Err(VoteError::AddressMismatch(_))
        ));
    }

    #[test]
    fn test_make_commit() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut set = VoteSet::new(CHAIN, 1, 0, SignedMsgType::Precommit, vals.clone());
        let bid = block_id(b"committed");
        for i in 0..3 {
            set.add_vote(signed_vote(&keys, &vals, i, SignedMsgType::Precommit, 0, bid))
                .unwrap();
        }
        let commit = set.make_commit().unwrap();
        assert_eq!(commit.height, 1);
        assert_eq!(commit.block_id, bid);
        assert_eq!(commit.signatures.len(), 4);
        assert_eq!(commit.num_signed(), 3);
    }

    #[test]
    fn test_height_vote_set_routes_and_pol_info() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut hvs = HeightVoteSet::new(CHAIN, 1, vals.clone());
        let bid = block_id(b"polka");

        // Polka at round 1 (votes for a future round are admitted).
        for i in 0..3 {
            hvs.add_vote(
                signed_vote(&keys, &vals, i, SignedMsgType::Prevote, 1, bid),
                "peer",
            )
            .unwrap();
        }
        assert_eq!(hvs.prevotes(1).two_thirds_majority(), Some(bid));
        assert_eq!(hvs.pol_info(), 1);

        // A nil polka at a higher round does not advance pol_info.
        for i in 0..3 {
            hvs.add_vote(
                signed_vote(&keys, &vals, i, SignedMsgType::Prevote, 2, BlockId::nil()),
                "peer",
            )
            .unwrap();
        }
        assert_eq!(hvs.pol_info(), 1);
    }

    #[test]
    fn test_one_prevote_and_one_precommit_per_validator() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut hvs = HeightVoteSet::new(CHAIN, 1, vals.clone());
        let bid = block_id(b"block");

        hvs.add_vote(
            signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, bid),
            "",
        )
        .unwrap();
        hvs.add_vote(
            signed_vote(&keys, &vals, 0, SignedMsgType::Precommit, 0, bid),
            "",
        )
        .unwrap();
        assert_eq!(hvs.prevotes(0).count(), 1);
        assert_eq!(hvs.precommits(0).count(), 1);

        // A second, different prevote at the same round is conflicting.
        assert!(hvs
            .add_vote(
                signed_vote(&keys, &vals, 0, SignedMsgType::Prevote, 0, BlockId::nil()),
                "",
            )
            .is_err());
        assert_eq!(hvs.prevotes(0).count(), 1);
    }

    #[test]
    fn test_set_round_allocates_range() {
        let keys = keypairs(4);
        let vals = validator_set(&keys);
        let mut hvs = HeightVoteSet::new(CHAIN, 1, vals);
        hvs.set_round(3);
        for r in 0..=3 {
            assert_eq!(hvs.prevotes(r).round(), r);
            assert_eq!(hvs.precommits(r).round(), r);
        }
    }
}
