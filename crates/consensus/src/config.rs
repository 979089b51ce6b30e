//! Consensus timing configuration.

use basalt_types::Round;
use serde::Deserialize;
use std::time::Duration;

/// Timeouts and block-creation policy for the consensus engine.
///
/// Each step timeout grows by its delta every round, so lagging validators
/// get progressively more time to catch up within a height.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// How long to wait for a complete proposal in round 0.
    #[serde(with = "duration_millis")]
    pub timeout_propose: Duration,
    /// Extra propose time per round.
    #[serde(with = "duration_millis")]
    pub timeout_propose_delta: Duration,
    /// How long to wait for remaining prevotes after seeing 2/3-any.
    #[serde(with = "duration_millis")]
    pub timeout_prevote: Duration,
    /// Extra prevote-wait time per round.
    #[serde(with = "duration_millis")]
    pub timeout_prevote_delta: Duration,
    /// How long to wait for remaining precommits after seeing 2/3-any.
    #[serde(with = "duration_millis")]
    pub timeout_precommit: Duration,
    /// Extra precommit-wait time per round.
    #[serde(with = "duration_millis")]
    pub timeout_precommit_delta: Duration,
    /// Delay between committing a block and starting round 0 of the next
    /// height, so slow validators' precommits still make it into the commit.
    #[serde(with = "duration_millis")]
    pub timeout_commit: Duration,
    /// Skip `timeout_commit` once precommits from every validator are in.
    pub skip_timeout_commit: bool,
    /// Whether to propose blocks with no transactions.
    pub create_empty_blocks: bool,
    /// If non-zero, propose an empty block after this long without
    /// transactions even when `create_empty_blocks` is false.
    #[serde(with = "duration_millis")]
    pub create_empty_blocks_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            timeout_propose: Duration::from_millis(3000),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_millis(1000),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_millis(1000),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_millis(1000),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
        }
    }
}

impl ConsensusConfig {
    /// Propose timeout for the given round.
    pub fn propose(&self, round: Round) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round.max(0) as u32
    }

    /// Prevote-wait timeout for the given round.
    pub fn prevote(&self, round: Round) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round.max(0) as u32
    }

    /// Precommit-wait timeout for the given round.
    pub fn precommit(&self, round: Round) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round.max(0) as u32
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_grow_per_round() {
        let config = ConsensusConfig::default();
        assert_eq!(config.propose(0), Duration::from_millis(3000));
        assert_eq!(config.propose(2), Duration::from_millis(4000));
        assert!(config.prevote(3) > config.prevote(0));
        assert!(config.precommit(3) > config.precommit(0));
    }

    #[test]
    fn test_deserialize() {
        let config: ConsensusConfig = serde_json::from_str(
            r#"{"timeout_propose": 500, "skip_timeout_commit": true}"#,
        )
        .unwrap();
        assert_eq!(config.timeout_propose, Duration::from_millis(500));
        assert!(config.skip_timeout_commit);
        // Unspecified fields keep their defaults.
        assert_eq!(config.timeout_commit, Duration::from_millis(1000));
    }
}
