//! The node runner.
//!
//! Wires the consensus core, timeout ticker, mempool and application
//! together, owns the receive loop, and exposes the node's ingress points:
//! `submit_message` for the transport and the mempool handle for RPC.

use crate::{AbciExecutor, StateStore};
use basalt_consensus::{
    ConsensusConfig, ConsensusCore, EventBus, PrivValidator, RoundState, TimeoutInfo,
    TimeoutTicker, TxSource,
};
use basalt_mempool::{TxPool, TxPoolConfig};
use basalt_messages::{ConsensusMessage, MessageInfo};
use basalt_types::{Application, ChainState, Tx};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors from building or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("missing required component: {0}")]
    MissingComponent(&'static str),

    #[error("state store error: {0}")]
    Store(#[from] crate::StoreError),

    #[error("consensus error: {0}")]
    Consensus(#[from] basalt_consensus::ConsensusError),
}

/// Adapts the mempool into the consensus core's transaction source.
pub struct MempoolTxSource {
    pool: Arc<TxPool>,
}

impl MempoolTxSource {
    /// Wrap a pool.
    pub fn new(pool: Arc<TxPool>) -> Self {
        MempoolTxSource { pool }
    }
}

impl TxSource for MempoolTxSource {
    fn reap(&self, max_bytes: u64, max_gas: i64) -> Vec<Tx> {
        self.pool
            .reap_max_bytes_gas(max_bytes, max_gas)
            .into_iter()
            .map(|tx| (*tx).clone())
            .collect()
    }
}

/// Handle for shutting down a running [`Node`].
///
/// Dropping the handle also signals shutdown.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Builder for a [`Node`].
pub struct NodeBuilder {
    consensus_config: ConsensusConfig,
    pool_config: TxPoolConfig,
    app: Option<Arc<dyn Application>>,
    store: Option<Arc<dyn StateStore>>,
    genesis: Option<ChainState>,
    priv_validator: Option<Arc<dyn PrivValidator>>,
    outbound: Option<mpsc::UnboundedSender<ConsensusMessage>>,
}

impl NodeBuilder {
    /// Start building a node.
    pub fn new() -> Self {
        NodeBuilder {
            consensus_config: ConsensusConfig::default(),
            pool_config: TxPoolConfig::default(),
            app: None,
            store: None,
            genesis: None,
            priv_validator: None,
            outbound: None,
        }
    }

    /// Consensus timing configuration.
    pub fn consensus_config(mut self, config: ConsensusConfig) -> Self {
        self.consensus_config = config;
        self
    }

    /// Mempool configuration.
    pub fn pool_config(mut self, config: TxPoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// The replicated application (required).
    pub fn app(mut self, app: Arc<dyn Application>) -> Self {
        self.app = Some(app);
        self
    }

    /// The persistent state store (required).
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Genesis state, used when the store holds no saved state (required).
    pub fn genesis(mut self, genesis: ChainState) -> Self {
        self.genesis = Some(genesis);
        self
    }

    /// The validator signing key. Omit for a non-validating full node.
    pub fn priv_validator(mut self, pv: Arc<dyn PrivValidator>) -> Self {
        self.priv_validator = Some(pv);
        self
    }

    /// Where self-published messages are forwarded for broadcast. Omit for
    /// a standalone (single-validator or test) node.
    pub fn outbound(mut self, tx: mpsc::UnboundedSender<ConsensusMessage>) -> Self {
        self.outbound = Some(tx);
        self
    }

    /// Assemble the node.
    pub fn build(self) -> Result<Node, NodeError> {
        let app = self.app.ok_or(NodeError::MissingComponent("app"))?;
        let store = self.store.ok_or(NodeError::MissingComponent("store"))?;

        // Resume from the stored state, falling back to genesis.
        let state = match store.load_state()? {
            Some(state) => {
                info!(height = state.last_block_height, "resuming from stored state");
                state
            }
            None => {
                let genesis = self.genesis.ok_or(NodeError::MissingComponent("genesis"))?;
                store.bootstrap(&genesis)?;
                genesis
            }
        };

        let pool = Arc::new(TxPool::new(self.pool_config, Arc::clone(&app)));
        let executor =
            Arc::new(AbciExecutor::new(app, Arc::clone(&store)).with_pool(Arc::clone(&pool)));

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (tock_tx, tock_rx) = mpsc::unbounded_channel();
        let ticker = TimeoutTicker::new(tock_tx);
        let bus = EventBus::default();

        let mut core = ConsensusCore::new(
            self.consensus_config,
            state,
            None,
            ticker.clone(),
            msg_tx.clone(),
            bus.clone(),
            executor,
            Arc::new(MempoolTxSource::new(Arc::clone(&pool))),
        )?;
        if let Some(pv) = self.priv_validator {
            core.set_priv_validator(pv);
        }

        Ok(Node {
            core: Arc::new(Mutex::new(core)),
            pool,
            ticker,
            bus,
            msg_tx,
            msg_rx: Some(msg_rx),
            tock_rx: Some(tock_rx),
            outbound: self.outbound,
            loop_handle: None,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        NodeBuilder::new()
    }
}

/// A running consensus node.
pub struct Node {
    core: Arc<Mutex<ConsensusCore>>,
    pool: Arc<TxPool>,
    ticker: TimeoutTicker,
    bus: EventBus,
    msg_tx: mpsc::UnboundedSender<MessageInfo>,
    msg_rx: Option<mpsc::UnboundedReceiver<MessageInfo>>,
    tock_rx: Option<mpsc::UnboundedReceiver<TimeoutInfo>>,
    outbound: Option<mpsc::UnboundedSender<ConsensusMessage>>,
    loop_handle: Option<JoinHandle<()>>,
}

impl Node {
    /// Start building a node.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// The mempool handle (RPC ingress).
    pub fn pool(&self) -> Arc<TxPool> {
        Arc::clone(&self.pool)
    }

    /// The consensus event bus.
    pub fn event_bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Deep copy of the current round state.
    pub fn round_state(&self) -> RoundState {
        self.core.lock().round_state()
    }

    /// Feed an inbound peer message into the consensus core.
    pub fn submit_message(&self, msg: ConsensusMessage, peer_id: impl Into<String>) {
        if self
            .msg_tx
            .send(MessageInfo::from_peer(msg, peer_id))
            .is_err()
        {
            warn!("message queue closed; dropping peer message");
        }
    }

    /// Start the receive loop and schedule round 0. Returns a handle that
    /// stops the node when dropped.
    pub fn start(&mut self) -> ShutdownHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut msg_rx = self.msg_rx.take().expect("start called once");
        let mut tock_rx = self.tock_rx.take().expect("start called once");
        let core = Arc::clone(&self.core);
        let ticker = self.ticker.clone();
        let outbound = self.outbound.clone();

        core.lock().start();

        // The receive loop: the single consumer of the internal queue and
        // the ticker, serializing all state transitions through the
        // consensus mutex.
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("consensus node shutting down");
                        ticker.stop();
                        break;
                    }
                    Some(mi) = msg_rx.recv() => {
                        let result = core.lock().receive(&mi);
                        if let Err(err) = result {
                            error!(%err, "fatal consensus error; tearing down");
                            ticker.stop();
                            break;
                        }
                        // Self-published messages also go out to peers.
                        if mi.is_internal() {
                            if let Some(out) = &outbound {
                                let _ = out.send(mi.msg);
                            }
                        }
                    }
                    Some(ti) = tock_rx.recv() => {
                        let result = core.lock().handle_timeout(ti);
                        if let Err(err) = result {
                            error!(%err, "fatal consensus error on timeout; tearing down");
                            ticker.stop();
                            break;
                        }
                    }
                }
            }
        });
        self.loop_handle = Some(handle);

        ShutdownHandle {
            tx: Some(shutdown_tx),
        }
    }

    /// Wait for the receive loop to exit (after shutdown or a fatal error).
    pub async fn join(&mut self) {
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
    }
}
