//! Node assembly for Basalt consensus.
//!
//! This crate wires the consensus core, mempool and application together and
//! provides the pieces that face the outside world:
//!
//! - [`codec`]: length-prefixed wire framing for consensus messages
//! - [`store`]: the persistent state store (RocksDB)
//! - [`executor`]: the ABCI-backed block executor
//! - [`node`]: the runner that owns the receive loop and timers

mod codec;
mod executor;
mod node;
mod store;

pub use codec::{decode_frame, encode_frame, frame_len, CodecError, MESSAGE_HEADER_SIZE};
pub use executor::AbciExecutor;
pub use node::{MempoolTxSource, Node, NodeBuilder, NodeError, ShutdownHandle};
pub use store::{RocksStateStore, StateStore, StoreError, VALIDATOR_SET_CHECKPOINT_INTERVAL};
