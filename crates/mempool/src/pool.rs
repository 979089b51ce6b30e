//! Concurrent mempool ingress.
//!
//! [`TxPool`] fronts the [`UnappliedTxQueue`] with an [`LruCache`] admission
//! filter and the application's `check_tx` callback. Any number of threads
//! may submit concurrently; the cache-then-queue pair guarantees at-most-once
//! insertion per transaction id. The pool mutex guards the queue and cache
//! jointly and is never held across application callbacks.

use crate::{LruCache, UnappliedTxQueue};
use basalt_types::{Application, ResponseCheckTx, Tx, TxId};
use parking_lot::Mutex;
use serde::Deserialize;
use std::ops::Bound;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Mempool limits and policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TxPoolConfig {
    /// Per-transaction encoded-size ceiling.
    pub max_tx_bytes: u64,
    /// Aggregate queue byte budget.
    pub max_bytes_budget: u64,
    /// Aggregate gas cap handed to the block builder; -1 for unlimited.
    pub max_gas_budget: i64,
    /// Capacity of the seen-transaction admission cache.
    pub cache_size: usize,
    /// Re-run `check_tx` on queued transactions after each committed block.
    pub recheck: bool,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        TxPoolConfig {
            max_tx_bytes: 1024 * 1024,
            max_bytes_budget: 512 * 1024 * 1024,
            max_gas_budget: -1,
            cache_size: 10_000,
            recheck: true,
        }
    }
}

/// Why a transaction was not admitted.
#[derive(Debug, Error)]
pub enum CheckTxError {
    /// The id was seen recently; duplicates are dropped before the
    /// application is consulted.
    #[error("transaction {0} already seen")]
    Duplicate(TxId),

    /// The encoded transaction exceeds the per-transaction ceiling.
    #[error("transaction is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    /// The application rejected the transaction.
    #[error("application rejected transaction (code {})", .0.code)]
    Rejected(ResponseCheckTx),

    /// The queue's aggregate byte budget is exhausted.
    #[error("mempool is full")]
    MempoolFull,
}

struct PoolInner {
    queue: UnappliedTxQueue,
    /// Recently seen transaction ids, including rejected ones.
    cache: LruCache<TxId, ()>,
}

/// Thread-safe mempool façade.
pub struct TxPool {
    config: TxPoolConfig,
    app: Arc<dyn Application>,
    inner: Mutex<PoolInner>,
}

impl TxPool {
    /// Create a pool backed by the given application.
    pub fn new(config: TxPoolConfig, app: Arc<dyn Application>) -> Self {
        let inner = PoolInner {
            queue: UnappliedTxQueue::new(config.max_bytes_budget),
            cache: LruCache::new(config.cache_size),
        };
        TxPool {
            config,
            app,
            inner: Mutex::new(inner),
        }
    }

    /// Number of queued transactions.
    pub fn size(&self) -> usize {
        self.inner.lock().queue.size()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Total queued bytes.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().queue.bytes()
    }

    /// Admit one transaction, blocking until the application's `check_tx`
    /// resolves.
    ///
    /// Steps: duplicate filter against the admission cache, application
    /// `check_tx` (outside the pool lock), then queue insertion. A rejected
    /// transaction still stays in the cache as a recently-seen filter.
    pub fn check_tx(&self, tx: Arc<Tx>) -> Result<ResponseCheckTx, CheckTxError> {
        let id = tx.id();
        let size = tx.size_bytes();
        if size > self.config.max_tx_bytes {
            return Err(CheckTxError::TooLarge {
                size,
                limit: self.config.max_tx_bytes,
            });
        }

        // Claim the id in the cache. A concurrent submitter of the same id
        // loses here, which is what makes admission at-most-once.
        {
            let mut inner = self.inner.lock();
            if inner.cache.has(&id) {
                trace!(%id, "tx already in admission cache");
                return Err(CheckTxError::Duplicate(id));
            }
            inner.cache.put(id, ());
        }

        // Application admission check runs without the pool lock.
        let response = self.app.check_tx(&tx);
        if !response.is_ok() {
            debug!(%id, code = response.code, "application rejected tx");
            // The id stays cached so repeated gossip of a bad tx is cheap.
            return Err(CheckTxError::Rejected(response));
        }

        let mut inner = self.inner.lock();
        if inner.queue.add_tx(Arc::clone(&tx)) {
            trace!(%id, queued = inner.queue.size(), "tx admitted");
            Ok(response)
        } else if inner.queue.has(&id) {
            // A concurrent caller with the same id slipped in between cache
            // eviction and now; the queue's id check keeps us at-most-once.
            Err(CheckTxError::Duplicate(id))
        } else {
            // Budget exhausted. Leave the id cached; it was still seen.
            Err(CheckTxError::MempoolFull)
        }
    }

    /// Admit one transaction asynchronously: the application callback runs
    /// on the blocking pool and the result arrives on the returned channel.
    pub fn check_tx_async(
        self: &Arc<Self>,
        tx: Arc<Tx>,
    ) -> oneshot::Receiver<Result<ResponseCheckTx, CheckTxError>> {
        let (result_tx, result_rx) = oneshot::channel();
        let pool = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = pool.check_tx(tx);
            if result_tx.send(result).is_err() {
                warn!("check_tx_async caller went away");
            }
        });
        result_rx
    }

    /// Take up to `count` transactions in ascending nonce order.
    pub fn reap_max_txs(&self, count: usize) -> Vec<Arc<Tx>> {
        let inner = self.inner.lock();
        inner
            .queue
            .iter_by_nonce(Bound::Unbounded, Bound::Unbounded)
            .take(count)
            .collect()
    }

    /// Take transactions highest-gas-first until either the byte or the gas
    /// bound would be exceeded. A `max_gas` of -1 means unlimited.
    pub fn reap_max_bytes_gas(&self, max_bytes: u64, max_gas: i64) -> Vec<Arc<Tx>> {
        let inner = self.inner.lock();
        let mut total_bytes = 0u64;
        let mut total_gas = 0i64;
        let mut reaped = Vec::new();
        for tx in inner.queue.iter_by_gas_rev(Bound::Unbounded, Bound::Unbounded) {
            let tx_bytes = tx.size_bytes();
            if total_bytes + tx_bytes > max_bytes {
                break;
            }
            let gas = tx.gas as i64;
            if max_gas >= 0 && total_gas + gas > max_gas {
                break;
            }
            total_bytes += tx_bytes;
            total_gas += gas;
            reaped.push(tx);
        }
        reaped
    }

    /// Remove transactions committed in a block and, per the recheck policy,
    /// revalidate what remains against the application.
    pub fn update(&self, committed: &[TxId]) {
        let survivors: Vec<Arc<Tx>> = {
            let mut inner = self.inner.lock();
            for id in committed {
                inner.queue.erase(id);
                // Keep committed ids cached: replays of an applied tx are
                // duplicates, not candidates.
                inner.cache.put(*id, ());
            }
            if !self.config.recheck {
                return;
            }
            inner
                .queue
                .iter_by_nonce(Bound::Unbounded, Bound::Unbounded)
                .collect()
        };

        // Recheck without the pool lock; drop what the application now
        // rejects.
        let mut evict = Vec::new();
        for tx in survivors {
            if !self.app.check_tx(&tx).is_ok() {
                evict.push(tx.id());
            }
        }
        if !evict.is_empty() {
            let mut inner = self.inner.lock();
            for id in &evict {
                inner.queue.erase(id);
            }
            debug!(evicted = evict.len(), "recheck evicted stale transactions");
        }
    }

    /// Drop every queued transaction and forget recently seen ids.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.cache.clear();
    }
}
