//! Network messages for the consensus protocol.

mod block_part;
mod envelope;
mod proposal;
mod vote;

pub use block_part::BlockPartMessage;
pub use envelope::{ConsensusMessage, MessageInfo, PeerId};
pub use proposal::ProposalMessage;
pub use vote::VoteMessage;
