//! Message union and delivery envelope.

use crate::{BlockPartMessage, ProposalMessage, VoteMessage};
use sbor::prelude::BasicSbor;

/// Identifies the peer a message arrived from. Empty for messages the node
/// published to itself on the internal queue.
pub type PeerId = String;

/// Every message the consensus engine can receive from a peer or from its
/// own internal queue. Dispatch is an exhaustive `match`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum ConsensusMessage {
    /// A signed block proposal.
    Proposal(ProposalMessage),
    /// One chunk of a proposed block.
    BlockPart(BlockPartMessage),
    /// A signed prevote or precommit.
    Vote(VoteMessage),
}

/// A message plus its provenance.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    /// The message itself.
    pub msg: ConsensusMessage,
    /// Originating peer; empty for internally published messages.
    pub peer_id: PeerId,
}

impl MessageInfo {
    /// Wrap a message that arrived from a peer.
    pub fn from_peer(msg: ConsensusMessage, peer_id: impl Into<PeerId>) -> Self {
        MessageInfo {
            msg,
            peer_id: peer_id.into(),
        }
    }

    /// Wrap a message published by the node itself.
    pub fn internal(msg: ConsensusMessage) -> Self {
        MessageInfo {
            msg,
            peer_id: PeerId::new(),
        }
    }

    /// Whether this message originated locally.
    pub fn is_internal(&self) -> bool {
        self.peer_id.is_empty()
    }
}
