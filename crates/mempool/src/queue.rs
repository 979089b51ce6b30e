//! The unapplied transaction queue.
//!
//! A bounded multi-index container: transactions are reachable by id, by
//! sender (in insertion order), by nonce and by gas. All indices are updated
//! together, so for every id present exactly one entry exists in each index.

use basalt_types::{Tx, TxId};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone)]
struct QueueEntry {
    tx: Arc<Tx>,
    size_bytes: u64,
    /// Insertion sequence, used for per-sender FIFO order.
    seq: u64,
}

/// Multi-indexed queue of transactions awaiting inclusion in a block.
///
/// Admission is capped by an aggregate byte budget; enforcement happens
/// before any index is touched, so a rejected add mutates nothing.
#[derive(Debug)]
pub struct UnappliedTxQueue {
    max_bytes: u64,
    bytes: u64,
    next_seq: u64,
    by_id: HashMap<TxId, QueueEntry>,
    by_sender: BTreeMap<(String, u64), TxId>,
    by_nonce: BTreeMap<(u64, TxId), ()>,
    by_gas: BTreeMap<(u64, TxId), ()>,
}

impl UnappliedTxQueue {
    /// Create a queue with the given aggregate byte budget.
    pub fn new(max_bytes: u64) -> Self {
        UnappliedTxQueue {
            max_bytes,
            bytes: 0,
            next_seq: 0,
            by_id: HashMap::new(),
            by_sender: BTreeMap::new(),
            by_nonce: BTreeMap::new(),
            by_gas: BTreeMap::new(),
        }
    }

    /// Number of queued transactions.
    pub fn size(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Total encoded bytes of queued transactions.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Add a transaction.
    ///
    /// Returns `false` without mutating anything when the id is already
    /// present or the byte budget would be exceeded.
    pub fn add_tx(&mut self, tx: Arc<Tx>) -> bool {
        let id = tx.id();
        if self.by_id.contains_key(&id) {
            trace!(%id, "tx already queued");
            return false;
        }
        let size_bytes = tx.size_bytes();
        if self.bytes + size_bytes > self.max_bytes {
            trace!(%id, size_bytes, queued_bytes = self.bytes, "tx queue byte budget exhausted");
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_sender.insert((tx.sender.clone(), seq), id);
        self.by_nonce.insert((tx.nonce, id), ());
        self.by_gas.insert((tx.gas, id), ());
        self.bytes += size_bytes;
        self.by_id.insert(
            id,
            QueueEntry {
                tx,
                size_bytes,
                seq,
            },
        );
        true
    }

    /// Look up a transaction by id.
    pub fn get_tx(&self, id: &TxId) -> Option<Arc<Tx>> {
        self.by_id.get(id).map(|e| Arc::clone(&e.tx))
    }

    /// Whether the id is queued.
    pub fn has(&self, id: &TxId) -> bool {
        self.by_id.contains_key(id)
    }

    /// All of one sender's transactions, in insertion order.
    pub fn get_by_sender<'a>(&'a self, sender: &str) -> impl Iterator<Item = Arc<Tx>> + 'a {
        let lo = (sender.to_string(), 0u64);
        let hi = (sender.to_string(), u64::MAX);
        self.by_sender
            .range((Bound::Included(lo), Bound::Included(hi)))
            .filter_map(|(_, id)| self.get_tx(id))
    }

    /// Remove a transaction. Returns `false` if it was absent.
    pub fn erase(&mut self, id: &TxId) -> bool {
        let Some(entry) = self.by_id.remove(id) else {
            return false;
        };
        self.by_sender.remove(&(entry.tx.sender.clone(), entry.seq));
        self.by_nonce.remove(&(entry.tx.nonce, *id));
        self.by_gas.remove(&(entry.tx.gas, *id));
        self.bytes -= entry.size_bytes;
        true
    }

    /// Drop every transaction.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_sender.clear();
        self.by_nonce.clear();
        self.by_gas.clear();
        self.bytes = 0;
    }

    /// Iterate transactions in ascending nonce order, within
    /// `[lower, upper]` nonce bounds.
    pub fn iter_by_nonce(
        &self,
        lower: Bound<u64>,
        upper: Bound<u64>,
    ) -> impl Iterator<Item = Arc<Tx>> + '_ {
        self.by_nonce
            .range(scalar_range(lower, upper))
            .filter_map(|((_, id), _)| self.get_tx(id))
    }

    /// Iterate transactions in descending nonce order.
    pub fn iter_by_nonce_rev(
        &self,
        lower: Bound<u64>,
        upper: Bound<u64>,
    ) -> impl Iterator<Item = Arc<Tx>> + '_ {
        self.by_nonce
            .range(scalar_range(lower, upper))
            .rev()
            .filter_map(|((_, id), _)| self.get_tx(id))
    }

    /// Iterate transactions in ascending gas order, within
    /// `[lower, upper]` gas bounds.
    pub fn iter_by_gas(
        &self,
        lower: Bound<u64>,
        upper: Bound<u64>,
    ) -> impl Iterator<Item = Arc<Tx>> + '_ {
        self.by_gas
            .range(scalar_range(lower, upper))
            .filter_map(|((_, id), _)| self.get_tx(id))
    }

    /// Iterate transactions in descending gas order.
    pub fn iter_by_gas_rev(
        &self,
        lower: Bound<u64>,
        upper: Bound<u64>,
    ) -> impl Iterator<Item = Arc<Tx>> + '_ {
        self.by_gas
            .range(scalar_range(lower, upper))
            .rev()
            .filter_map(|((_, id), _)| self.get_tx(id))
    }

    /// All queued ids.
    pub fn ids(&self) -> impl Iterator<Item = &TxId> {
        self.by_id.keys()
    }
}

/// Translate scalar bounds into composite-key bounds over `(value, id)`.
fn scalar_range(
    lower: Bound<u64>,
    upper: Bound<u64>,
) -> (Bound<(u64, TxId)>, Bound<(u64, TxId)>) {
    let min_id = TxId::from_hash_bytes([0u8; 32]);
    let max_id = TxId::from_hash_bytes([0xFF; 32]);
    let lo = match lower {
        Bound::Included(v) => Bound::Included((v, min_id)),
        Bound::Excluded(v) => Bound::Excluded((v, max_id)),
        Bound::Unbounded => Bound::Unbounded,
    };
    let hi = match upper {
        Bound::Included(v) => Bound::Included((v, max_id)),
        Bound::Excluded(v) => Bound::Excluded((v, min_id)),
        Bound::Unbounded => Bound::Unbounded,
    };
    (lo, hi)
}
