//! Node-level integration tests with real timers.

use basalt_consensus::{ConsensusConfig, ConsensusEvent, LocalSigner};
use basalt_mempool::TxPoolConfig;
use basalt_node::{Node, RocksStateStore, StateStore};
use basalt_types::{
    Address, Application, BlockHeader, ChainState, ConsensusParams, Hash, Height, KeyPair,
    LastCommitInfo, ResponseBeginBlock, ResponseCheckTx, ResponseDeliverTx, ResponseEndBlock, Tx,
    Validator, ValidatorSet,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// A counter application: every commit hashes the number of applied txs.
struct CounterApp {
    applied: AtomicU64,
}

impl CounterApp {
    fn new() -> Arc<Self> {
        Arc::new(CounterApp {
            applied: AtomicU64::new(0),
        })
    }
}

impl Application for CounterApp {
    fn check_tx(&self, _tx: &Tx) -> ResponseCheckTx {
        ResponseCheckTx::default()
    }

    fn begin_block(
        &self,
        _header: &BlockHeader,
        _last_commit: &LastCommitInfo,
        _byzantine_validators: &[Address],
    ) -> ResponseBeginBlock {
        ResponseBeginBlock::default()
    }

    fn deliver_tx(&self, _tx: &Tx) -> ResponseDeliverTx {
        self.applied.fetch_add(1, Ordering::SeqCst);
        ResponseDeliverTx::default()
    }

    fn end_block(&self, _height: Height) -> ResponseEndBlock {
        ResponseEndBlock::default()
    }

    fn commit(&self) -> Hash {
        Hash::from_bytes(&self.applied.load(Ordering::SeqCst).to_le_bytes())
    }
}

fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        timeout_propose: Duration::from_millis(400),
        timeout_propose_delta: Duration::from_millis(200),
        timeout_prevote: Duration::from_millis(200),
        timeout_prevote_delta: Duration::from_millis(100),
        timeout_precommit: Duration::from_millis(200),
        timeout_precommit_delta: Duration::from_millis(100),
        timeout_commit: Duration::from_millis(50),
        ..Default::default()
    }
}

fn genesis(keys: &[KeyPair]) -> ChainState {
    let validators = ValidatorSet::new(
        keys.iter()
            .map(|kp| Validator::new(kp.public_key(), 10))
            .collect(),
    );
    ChainState::new_genesis("node-chain", 1, validators, ConsensusParams::default())
}

/// A single validator is its own 2/3+ majority: the chain advances height
/// after height, and a submitted transaction lands in a block.
#[tokio::test(flavor = "multi_thread")]
async fn test_single_validator_commits_blocks() {
    let key = KeyPair::from_seed(&[42; 32]);
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(RocksStateStore::open(dir.path()).unwrap());
    let app = CounterApp::new();

    let mut node = Node::builder()
        .consensus_config(fast_config())
        .pool_config(TxPoolConfig::default())
        .app(app.clone())
        .store(store)
        .genesis(genesis(std::slice::from_ref(&key)))
        .priv_validator(Arc::new(LocalSigner::new(key)))
        .build()
        .unwrap();

    let mut events = node.event_bus().subscribe();
    let _shutdown = node.start();

    // Wait for the first committed block.
    let first = timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(ConsensusEvent::CommittedBlock { height, .. }) = events.recv().await {
                return height;
            }
        }
    })
    .await
    .expect("a block should commit");
    assert_eq!(first, 1);

    // Submit a transaction; it must appear in a following block.
    let tx = Arc::new(Tx::new("alice", 0, 100, b"payload".to_vec()));
    node.pool().check_tx(Arc::clone(&tx)).unwrap();

    let found = timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(ConsensusEvent::CommittedBlock { block, .. }) = events.recv().await {
                if block.txs.iter().any(|t| t.id() == tx.id()) {
                    return true;
                }
            }
        }
    })
    .await
    .expect("the submitted tx should commit");
    assert!(found);
    assert!(app.applied.load(Ordering::SeqCst) >= 1);
    // The committed tx left the mempool.
    assert_eq!(node.pool().size(), 0);
}

/// Four nodes wired through in-process channels reach consensus together.
#[tokio::test(flavor = "multi_thread")]
async fn test_four_node_network_commits() {
    let keys: Vec<KeyPair> = (0..4).map(|i| KeyPair::from_seed(&[i + 10; 32])).collect();
    let state = genesis(&keys);

    let mut nodes = Vec::new();
    let mut outbound_rxs = Vec::new();
    let mut dirs = Vec::new();
    for key in &keys {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(RocksStateStore::open(dir.path()).unwrap());
        dirs.push(dir);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let node = Node::builder()
            .consensus_config(fast_config())
            .app(CounterApp::new())
            .store(store)
            .genesis(state.clone())
            .priv_validator(Arc::new(LocalSigner::new(key.clone())))
            .outbound(out_tx)
            .build()
            .unwrap();
        nodes.push(node);
        outbound_rxs.push(out_rx);
    }

    let mut event_rxs: Vec<_> = nodes.iter().map(|n| n.event_bus().subscribe()).collect();
    let mut shutdown_handles = Vec::new();
    let nodes: Vec<Arc<Node>> = nodes
        .into_iter()
        .map(|mut n| {
            shutdown_handles.push(n.start());
            Arc::new(n)
        })
        .collect();

    // Router: everything a node publishes goes to the other three.
    for (i, mut rx) in outbound_rxs.into_iter().enumerate() {
        let peers: Vec<Arc<Node>> = nodes
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, n)| Arc::clone(n))
            .collect();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                for peer in &peers {
                    peer.submit_message(msg.clone(), format!("node-{i}"));
                }
            }
        });
    }

    // Every node should commit height 1.
    for (i, events) in event_rxs.iter_mut().enumerate() {
        let height = timeout(Duration::from_secs(30), async {
            loop {
                if let Ok(ConsensusEvent::CommittedBlock { height, .. }) = events.recv().await {
                    return height;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("node {i} should commit height 1"));
        assert_eq!(height, 1);
    }
}
