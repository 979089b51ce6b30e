//! Validators and validator sets.
//!
//! Proposer selection follows the weighted round-robin used by Tendermint:
//! every rotation each validator's priority grows by its voting power, the
//! validator with the maximum priority proposes and pays the total power back.
//! Over time each validator proposes in proportion to its power.

use crate::{Address, Hash, PublicKey, ValidatorUpdate};
use sbor::prelude::BasicSbor;

/// Upper bound on priority spread relative to total power. Priorities are
/// rescaled when the spread exceeds `PRIORITY_WINDOW_FACTOR * total_power`.
const PRIORITY_WINDOW_FACTOR: i64 = 2;

/// A single validator.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Validator {
    /// Address derived from the public key.
    pub address: Address,
    /// Public key used to verify votes and proposals.
    pub pub_key: PublicKey,
    /// Non-negative voting power.
    pub voting_power: i64,
    /// Rotating proposer priority.
    pub proposer_priority: i64,
}

impl Validator {
    /// Create a validator with zero initial priority.
    pub fn new(pub_key: PublicKey, voting_power: i64) -> Self {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// An ordered set of validators.
///
/// Validators are kept sorted by address, which makes the set hash and
/// proposer rotation deterministic across nodes.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    /// Build a set from a list of validators. Sorts by address.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        ValidatorSet { validators }
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// All validators, in address order.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Sum of all voting powers.
    pub fn total_voting_power(&self) -> i64 {
        self.validators.iter().map(|v| v.voting_power).sum()
    }

    /// Whether `power` is a 2/3+ majority of the total power.
    pub fn has_two_thirds(&self, power: i64) -> bool {
        power * 3 > self.total_voting_power() * 2
    }

    /// Look up a validator by index.
    pub fn get_by_index(&self, index: i32) -> Option<&Validator> {
        if index < 0 {
            return None;
        }
        self.validators.get(index as usize)
    }

    /// Look up a validator and its index by address.
    pub fn get_by_address(&self, address: &Address) -> Option<(i32, &Validator)> {
        self.validators
            .iter()
            .position(|v| v.address == *address)
            .map(|i| (i as i32, &self.validators[i]))
    }

    /// Whether the set contains a validator with the given address.
    pub fn has_address(&self, address: &Address) -> bool {
        self.validators.iter().any(|v| v.address == *address)
    }

    /// The current proposer: the validator with maximum priority,
    /// ties broken by address.
    pub fn proposer(&self) -> Option<&Validator> {
        self.validators.iter().max_by(|a, b| {
            a.proposer_priority
                .cmp(&b.proposer_priority)
                .then_with(|| b.address.cmp(&a.address))
        })
    }

    /// Advance the proposer rotation by `times` rounds.
    ///
    /// Each rotation adds every validator's power to its priority, then the
    /// maximum-priority validator (the proposer for that round) pays back the
    /// total power.
    pub fn increment_proposer_priority(&mut self, times: i32) {
        if self.validators.is_empty() {
            return;
        }
        self.rescale_priorities();
        for _ in 0..times.max(0) {
            for v in &mut self.validators {
                v.proposer_priority += v.voting_power;
            }
            let total = self.total_voting_power();
            if let Some(idx) = self.max_priority_index() {
                self.validators[idx].proposer_priority -= total;
            }
        }
    }

    fn max_priority_index(&self) -> Option<usize> {
        self.validators
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.proposer_priority
                    .cmp(&b.proposer_priority)
                    .then_with(|| b.address.cmp(&a.address))
            })
            .map(|(i, _)| i)
    }

    /// Center priorities on zero and clamp the spread, so repeated rotation
    /// cannot overflow `i64`.
    fn rescale_priorities(&mut self) {
        if self.validators.is_empty() {
            return;
        }
        let avg: i64 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .sum::<i64>()
            / self.validators.len() as i64;
        for v in &mut self.validators {
            v.proposer_priority -= avg;
        }
        let max = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .max()
            .unwrap_or(0);
        let min = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .min()
            .unwrap_or(0);
        let spread = max.saturating_sub(min);
        let window = PRIORITY_WINDOW_FACTOR * self.total_voting_power();
        if window > 0 && spread > window {
            let ratio = (spread + window - 1) / window;
            for v in &mut self.validators {
                v.proposer_priority /= ratio;
            }
        }
    }

    /// Apply validator updates from the application.
    ///
    /// Power 0 removes a validator; otherwise the validator is inserted or
    /// its power replaced. New validators start at zero priority.
    pub fn apply_updates(&mut self, updates: &[ValidatorUpdate]) {
        for update in updates {
            let address = update.pub_key.address();
            if update.power == 0 {
                self.validators.retain(|v| v.address != address);
            } else if let Some(v) = self.validators.iter_mut().find(|v| v.address == address) {
                v.voting_power = update.power;
            } else {
                self.validators.push(Validator::new(update.pub_key, update.power));
            }
        }
        self.validators.sort_by(|a, b| a.address.cmp(&b.address));
    }

    /// Hash of the set (addresses and powers), for block headers.
    pub fn hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(self.validators.len() * 28);
        for v in &self.validators {
            bytes.extend_from_slice(v.address.as_bytes());
            bytes.extend_from_slice(&v.voting_power.to_le_bytes());
        }
        Hash::from_bytes(&bytes)
    }
}
