//! BFT consensus state machine.
//!
//! This crate implements a Tendermint-style round-based consensus protocol.
//! For each height, validators run numbered rounds of
//! propose → prevote → precommit until 2/3+ of the voting power precommits a
//! single block, which is then committed and applied.
//!
//! # Architecture
//!
//! [`ConsensusCore`] owns the [`RoundState`] and is the only thing that
//! mutates it. It responds to three stimuli:
//!
//! - `receive(msg)` — a proposal, block part or vote arrived (from a peer or
//!   from the node's own internal queue)
//! - `handle_timeout(ti)` — the [`TimeoutTicker`]'s armed timer fired
//! - block application completing, which advances the state to the next
//!   height via `update_to_state`
//!
//! All I/O is injected: outbound messages go to the internal message queue,
//! step transitions are published on the [`EventBus`], block application goes
//! through a [`BlockExecutor`], and proposals pull transactions from a
//! [`TxSource`]. The transport layer decides when `receive` is called.
//!
//! # Safety
//!
//! - **Locking**: once a polka forms for a block, a validator locks on it and
//!   will only prevote/precommit that block until a later polka for a
//!   different block unlocks it.
//! - **Quorum intersection**: two 2/3+ quorums overlap in at least one honest
//!   validator, so conflicting blocks cannot both gather precommit majorities.
//! - **Monotonicity**: `(height, round, step)` never decreases; stale
//!   messages and timeouts are dropped.

mod config;
mod event;
mod part_set;
mod priv_validator;
mod round_state;
mod state;
mod ticker;
mod vote_set;

pub use config::ConsensusConfig;
pub use event::{ConsensusEvent, EventBus};
pub use part_set::{PartSet, BLOCK_PART_SIZE_BYTES};
pub use priv_validator::{LocalSigner, PrivValidator, SignError};
pub use round_state::{RoundState, Step};
pub use state::{BlockExecutor, ConsensusCore, ConsensusError, NoopTxSource, TxSource};
pub use ticker::{TimeoutInfo, TimeoutTicker};
pub use vote_set::{HeightVoteSet, VoteError, VoteSet};
