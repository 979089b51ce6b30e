//! Block part gossip message.

use basalt_types::{Height, Part, Round};
use sbor::prelude::BasicSbor;

/// One chunk of a proposed block, gossiped alongside the proposal so the
/// block can be reassembled and verified part by part.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockPartMessage {
    /// Height of the block this part belongs to.
    pub height: Height,
    /// Round the block was proposed in.
    pub round: Round,
    /// The chunk and its inclusion proof.
    pub part: Part,
}

impl BlockPartMessage {
    /// Create a new block part message.
    pub fn new(height: Height, round: Round, part: Part) -> Self {
        BlockPartMessage {
            height,
            round,
            part,
        }
    }

    /// Index of the carried part.
    pub fn index(&self) -> u32 {
        self.part.index
    }
}
