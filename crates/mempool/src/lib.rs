//! Transaction mempool.
//!
//! Candidate transactions enter through [`TxPool::check_tx`], pass the
//! application's admission check, and land in the [`UnappliedTxQueue`] where
//! the block builder reaps them. An [`LruCache`] of recently seen ids filters
//! duplicates before they ever reach the application, and guarantees
//! at-most-once admission under concurrent ingress.

mod lru;
mod pool;
mod queue;

pub use lru::LruCache;
pub use pool::{CheckTxError, TxPool, TxPoolConfig};
pub use queue::UnappliedTxQueue;
