//! The consensus state machine.
//!
//! [`ConsensusCore`] drives the Tendermint round algorithm:
//! propose → prevote → precommit, with locking, round skips and the
//! valid-block rule. It owns the [`RoundState`] and is the only thing that
//! mutates it; callers serialize access through a single mutex.

use crate::{
    ConsensusConfig, ConsensusEvent, EventBus, PartSet, PrivValidator, RoundState, Step,
    TimeoutInfo, TimeoutTicker, VoteError, VoteSet,
};
use basalt_messages::{BlockPartMessage, ConsensusMessage, MessageInfo, ProposalMessage, VoteMessage};
use basalt_types::{
    now_millis, proposal_sign_bytes, Block, BlockHeader, BlockId, ChainState, Commit, Hash, Height,
    PartSetHeader, Proposal, PublicKey, Round, SignedMsgType, Timestamp, Tx, Vote,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Fatal consensus failures. Transient peer misbehavior is logged and
/// dropped; these errors mean the engine cannot safely continue.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("invalid timeout step {0}")]
    InvalidTimeoutStep(Step),

    #[error("block application failed: {0}")]
    Apply(String),
}

/// Applies finalized blocks to the replicated application.
///
/// The core calls `validate_block` before proposing, prevoting or locking a
/// block, and `apply_block` exactly once per committed height.
pub trait BlockExecutor: Send + Sync {
    /// Check a block against the current chain state.
    fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), String>;

    /// Apply a committed block, returning the chain state for the next
    /// height.
    fn apply_block(
        &self,
        state: &ChainState,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<ChainState, String>;
}

/// Where proposals pull their transactions from.
pub trait TxSource: Send + Sync {
    /// Up to `max_bytes` worth of transactions, total gas at most `max_gas`
    /// (-1 for unlimited).
    fn reap(&self, max_bytes: u64, max_gas: i64) -> Vec<Tx>;
}

/// A transaction source that never has transactions.
pub struct NoopTxSource;

impl TxSource for NoopTxSource {
    fn reap(&self, _max_bytes: u64, _max_gas: i64) -> Vec<Tx> {
        Vec::new()
    }
}

/// The round state machine.
///
/// Responds to three stimuli: [`receive`](Self::receive) for peer/internal
/// messages, [`handle_timeout`](Self::handle_timeout) for ticker fires, and
/// block application completing inside `finalize_commit`. Every collaborator
/// is injected at construction.
pub struct ConsensusCore {
    config: ConsensusConfig,
    /// Chain state as of the last committed block.
    local_state: ChainState,
    /// The state being driven. Exposed outside only by clone.
    rs: RoundState,
    priv_validator: Option<Arc<dyn PrivValidator>>,
    /// Memoized public key of the private validator.
    priv_pub_key: Option<PublicKey>,
    ticker: TimeoutTicker,
    /// Internal message queue: self-published proposals, parts and votes
    /// re-enter through the normal receive path.
    internal_tx: mpsc::UnboundedSender<MessageInfo>,
    bus: EventBus,
    executor: Arc<dyn BlockExecutor>,
    tx_source: Arc<dyn TxSource>,
    n_steps: u64,
}

impl ConsensusCore {
    /// Build a core for the given chain state.
    ///
    /// When resuming a chain with `last_block_height > 0`, `last_commit`
    /// must carry the precommits reconstructed from the block store;
    /// for a fresh chain pass `None`.
    pub fn new(
        config: ConsensusConfig,
        state: ChainState,
        last_commit: Option<VoteSet>,
        ticker: TimeoutTicker,
        internal_tx: mpsc::UnboundedSender<MessageInfo>,
        bus: EventBus,
        executor: Arc<dyn BlockExecutor>,
        tx_source: Arc<dyn TxSource>,
    ) -> Result<Self, ConsensusError> {
        let rs = RoundState {
            height: 0,
            round: 0,
            step: Step::NewHeight,
            start_time: 0,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            valid_round: -1,
            valid_block: None,
            valid_block_parts: None,
            votes: crate::HeightVoteSet::new(state.chain_id.clone(), 0, state.validators.clone()),
            commit_round: -1,
            commit_time: 0,
            last_commit,
            validators: state.validators.clone(),
            last_validators: state.last_validators.clone(),
            triggered_timeout_precommit: false,
        };
        let mut core = ConsensusCore {
            config,
            local_state: ChainState::empty(),
            rs,
            priv_validator: None,
            priv_pub_key: None,
            ticker,
            internal_tx,
            bus,
            executor,
            tx_source,
            n_steps: 0,
        };
        core.update_to_state(state)?;
        Ok(core)
    }

    /// Install the private validator used to sign proposals and votes.
    pub fn set_priv_validator(&mut self, pv: Arc<dyn PrivValidator>) {
        self.priv_pub_key = Some(pv.pub_key());
        self.priv_validator = Some(pv);
    }

    /// Schedule the start of round 0 at the configured start time.
    pub fn start(&mut self) {
        self.schedule_round_0();
    }

    /// Deep copy of the round state.
    pub fn round_state(&self) -> RoundState {
        self.rs.clone()
    }

    /// Copy of the chain state as of the last committed block.
    pub fn state(&self) -> ChainState {
        self.local_state.clone()
    }

    /// Height of the last committed block.
    pub fn last_height(&self) -> Height {
        self.rs.height - 1
    }

    /// Number of step transitions so far.
    pub fn steps_taken(&self) -> u64 {
        self.n_steps
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stimuli
    // ═══════════════════════════════════════════════════════════════════════

    /// Process one inbound message. The transport decides when to call this;
    /// the caller must hold the consensus mutex.
    pub fn receive(&mut self, mi: &MessageInfo) -> Result<(), ConsensusError> {
        match &mi.msg {
            ConsensusMessage::Proposal(msg) => {
                // Will not cause a transition by itself; once the proposal is
                // set we can receive block parts.
                self.set_proposal(&msg.proposal);
                Ok(())
            }
            ConsensusMessage::BlockPart(msg) => {
                let added = self.add_proposal_block_part(msg, &mi.peer_id)?;
                if added && msg.round != self.rs.round {
                    debug!(
                        height = self.rs.height,
                        cs_round = self.rs.round,
                        part_round = msg.round,
                        "received block part from a different round"
                    );
                }
                Ok(())
            }
            ConsensusMessage::Vote(msg) => {
                // If the vote yields 2/3-any or a 2/3 majority, we transition.
                self.try_add_vote(&msg.vote, &mi.peer_id)
            }
        }
    }

    /// Process a fired timeout.
    pub fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), ConsensusError> {
        debug!(height = ti.height, round = ti.round, step = %ti.step, "received tock");

        // Timeouts must be for the current height/round/step or later.
        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            debug!(current = %self.rs.hrs(), "ignoring tock because we are ahead");
            return Ok(());
        }

        match ti.step {
            Step::NewHeight => self.enter_new_round(ti.height, 0),
            Step::NewRound => self.enter_propose(ti.height, 0),
            Step::Propose => self.enter_prevote(ti.height, ti.round),
            Step::PrevoteWait => self.enter_precommit(ti.height, ti.round),
            Step::PrecommitWait => {
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round + 1)
            }
            other => Err(ConsensusError::InvalidTimeoutStep(other)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Step transitions
    // ═══════════════════════════════════════════════════════════════════════

    fn update_round_step(&mut self, round: Round, step: Step) {
        self.rs.round = round;
        self.rs.step = step;
    }

    /// Count a transition and publish it to observers.
    fn new_step(&mut self) {
        self.n_steps += 1;
        self.bus.publish(ConsensusEvent::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
        });
    }

    fn schedule_timeout(&self, duration: Duration, height: Height, round: Round, step: Step) {
        self.ticker.schedule(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    /// Schedule `enter_new_round(height, 0)` at the round-0 start time.
    fn schedule_round_0(&self) {
        let now = now_millis();
        let sleep = Duration::from_millis(self.rs.start_time.saturating_sub(now));
        self.schedule_timeout(sleep, self.rs.height, 0, Step::NewHeight);
    }

    fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            debug!(current = %self.rs.hrs(), height, round, "entering new round with invalid args");
            return Ok(());
        }
        if self.rs.start_time > now_millis() {
            debug!("starting new round before the scheduled start time");
        }
        info!(current = %self.rs.hrs(), round, "entering new round");

        // Advance the proposer rotation by however many rounds we skipped.
        let prior_round = self.rs.round;
        if prior_round < round {
            self.rs
                .validators
                .increment_proposer_priority(round - prior_round);
        }

        self.update_round_step(round, Step::NewRound);
        if round != 0 {
            // Round 0 proposal state was already cleared on the new height,
            // and a round-0 proposal may have arrived in the meantime.
            debug!("resetting proposal info");
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round.saturating_add(1));
        self.rs.triggered_timeout_precommit = false;

        self.new_step();
        self.enter_propose(height, round)
    }

    fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Propose)
        {
            debug!(current = %self.rs.hrs(), height, round, "entering propose step with invalid args");
            return Ok(());
        }
        debug!(current = %self.rs.hrs(), "entering propose step");
        self.update_round_step(round, Step::Propose);

        // If the proposal and all block parts do not arrive in time,
        // prevote nil.
        self.schedule_timeout(self.config.propose(round), height, round, Step::Propose);

        self.maybe_decide_proposal(height, round);

        self.new_step();
        if self.is_proposal_complete() {
            let current_round = self.rs.round;
            self.enter_prevote(height, current_round)?;
        }
        Ok(())
    }

    /// Produce a proposal if this node is the round's proposer.
    fn maybe_decide_proposal(&mut self, height: Height, round: Round) {
        if self.priv_validator.is_none() {
            debug!("node is not a validator");
            return;
        }
        let Some(pub_key) = self.priv_pub_key else {
            // A validator without a key misses its proposing slot.
            error!("propose step; private validator public key is not set");
            return;
        };
        let address = pub_key.address();
        if !self.rs.validators.has_address(&address) {
            debug!(%address, "node is not in the validator set");
            return;
        }
        let is_proposer = self
            .rs
            .validators
            .proposer()
            .is_some_and(|p| p.address == address);
        if is_proposer {
            debug!("propose step; our turn to propose");
            self.decide_proposal(height, round);
        } else {
            debug!("propose step; not our turn to propose");
        }
    }

    fn decide_proposal(&mut self, height: Height, round: Round) {
        // Re-propose the valid block if there is one; otherwise build a new
        // block from the mempool.
        let (block, block_parts) = if let (Some(block), Some(parts)) =
            (self.rs.valid_block.clone(), self.rs.valid_block_parts.clone())
        {
            (block, parts)
        } else {
            match self.create_proposal_block() {
                Some((block, parts)) => (Arc::new(block), parts),
                None => return,
            }
        };

        let block_id = BlockId {
            hash: block.hash(),
            parts: block_parts.header(),
        };
        let mut proposal = Proposal::new(height, round, self.rs.valid_round, block_id, now_millis());

        let Some(pv) = &self.priv_validator else {
            return;
        };
        if let Err(err) = pv.sign_proposal(&self.local_state.chain_id, &mut proposal) {
            error!(height, round, %err, "propose step; failed signing proposal");
            return;
        }

        // Publish the proposal and every part on the internal queue; the
        // normal receive path admits them and the transport broadcasts them.
        self.publish_internal(ConsensusMessage::Proposal(ProposalMessage::new(proposal)));
        for part in block_parts.parts() {
            self.publish_internal(ConsensusMessage::BlockPart(BlockPartMessage::new(
                height,
                round,
                part.clone(),
            )));
        }
        debug!(height, round, "signed proposal");
    }

    /// Build a fresh proposal block from the mempool and the last commit.
    fn create_proposal_block(&mut self) -> Option<(Block, PartSet)> {
        let height = self.rs.height;

        let last_commit = if height == self.local_state.initial_height {
            // The very first block carries an empty commit.
            Commit::empty()
        } else {
            match self.rs.last_commit.as_ref().and_then(|lc| lc.make_commit()) {
                Some(commit) => commit,
                None => {
                    error!("propose step; cannot propose without commit for the previous block");
                    return None;
                }
            }
        };

        let max_bytes = self.local_state.consensus_params.block.max_bytes;
        let max_gas = self.local_state.consensus_params.block.max_gas;
        let txs = self.tx_source.reap(max_bytes, max_gas);

        if txs.is_empty() && !self.config.create_empty_blocks {
            let interval = self.config.create_empty_blocks_interval;
            let waited_out = !interval.is_zero()
                && now_millis().saturating_sub(self.local_state.last_block_time)
                    >= interval.as_millis() as u64;
            if !waited_out {
                debug!("propose step; no transactions and empty blocks are disabled");
                return None;
            }
        }

        let proposer_address = self.priv_pub_key?.address();
        let time = self.block_time();
        let last_commit_hash = commit_hash(&last_commit);
        let header = BlockHeader {
            chain_id: self.local_state.chain_id.clone(),
            height,
            time,
            last_block_id: self.local_state.last_block_id,
            last_commit_hash,
            data_hash: Block::compute_data_hash(&txs),
            validators_hash: self.rs.validators.hash(),
            app_hash: self.local_state.app_hash,
            proposer_address,
        };
        let block = Block {
            header,
            txs,
            last_commit,
        };

        if let Err(reason) = block.validate_basic() {
            error!(%reason, "propose step; built an invalid block");
            return None;
        }
        if let Err(reason) = self.executor.validate_block(&self.local_state, &block) {
            error!(%reason, "propose step; application rejected the block");
            return None;
        }

        let parts = PartSet::from_block(&block);
        Some((block, parts))
    }

    /// BFT block time: strictly after the previous block.
    fn block_time(&self) -> Timestamp {
        now_millis().max(self.local_state.last_block_time + 1)
    }

    /// A proposal is complete once the block is assembled and, if it claims a
    /// proof-of-lock round, the prevotes from that round back it.
    fn is_proposal_complete(&mut self) -> bool {
        let Some(proposal) = self.rs.proposal.clone() else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round < 0 {
            return true;
        }
        // If this is false the proposer is lying or we have not yet received
        // the proof-of-lock.
        self.rs
            .votes
            .prevotes(proposal.pol_round)
            .has_two_thirds_majority()
    }

    fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Prevote)
        {
            debug!(current = %self.rs.hrs(), height, round, "entering prevote step with invalid args");
            return Ok(());
        }
        debug!(current = %self.rs.hrs(), "entering prevote step");
        self.update_round_step(round, Step::Prevote);

        self.do_prevote();

        self.new_step();
        // Once `add_vote` sees 2/3-any prevotes we move to PrevoteWait.
        Ok(())
    }

    /// Prevote the locked block if locked, the proposal block if valid,
    /// otherwise nil.
    fn do_prevote(&mut self) {
        if let (Some(block), Some(parts)) = (
            self.rs.locked_block.clone(),
            self.rs.locked_block_parts.clone(),
        ) {
            debug!("prevote step; already locked on a block; prevoting the locked block");
            self.sign_add_vote(SignedMsgType::Prevote, block.hash(), parts.header());
            return;
        }

        let Some(block) = self.rs.proposal_block.clone() else {
            debug!("prevote step; proposal block is nil; prevoting nil");
            self.sign_add_vote(SignedMsgType::Prevote, Hash::ZERO, PartSetHeader::zero());
            return;
        };

        if let Err(reason) = block
            .validate_basic()
            .and_then(|_| self.executor.validate_block(&self.local_state, &block))
        {
            warn!(%reason, "prevote step; proposal block is invalid; prevoting nil");
            self.sign_add_vote(SignedMsgType::Prevote, Hash::ZERO, PartSetHeader::zero());
            return;
        }

        debug!("prevote step; proposal block is valid; prevoting it");
        let parts_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(|p| p.header())
            .unwrap_or_else(PartSetHeader::zero);
        self.sign_add_vote(SignedMsgType::Prevote, block.hash(), parts_header);
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::PrevoteWait)
        {
            debug!(current = %self.rs.hrs(), height, round, "entering prevote_wait step with invalid args");
            return Ok(());
        }
        if !self.rs.votes.prevotes(round).has_two_thirds_any() {
            return Err(ConsensusError::Invariant(format!(
                "entering prevote_wait step ({height}/{round}) without 2/3-any prevotes"
            )));
        }
        debug!(current = %self.rs.hrs(), "entering prevote_wait step");
        self.update_round_step(round, Step::PrevoteWait);

        // Wait a little longer for a polka.
        self.schedule_timeout(self.config.prevote(round), height, round, Step::PrevoteWait);
        self.new_step();
        Ok(())
    }

    fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Precommit)
        {
            debug!(current = %self.rs.hrs(), height, round, "entering precommit step with invalid args");
            return Ok(());
        }
        debug!(current = %self.rs.hrs(), "entering precommit step");
        self.update_round_step(round, Step::Precommit);

        let maj = self.rs.votes.prevotes(round).two_thirds_majority();

        let Some(block_id) = maj else {
            // No polka: precommit nil.
            if self.rs.locked_block.is_some() {
                debug!("precommit step; no polka while locked; precommitting nil");
            } else {
                debug!("precommit step; no polka; precommitting nil");
            }
            self.sign_add_vote(SignedMsgType::Precommit, Hash::ZERO, PartSetHeader::zero());
            self.new_step();
            return Ok(());
        };

        // 2/3+ prevoted nil: unlock and precommit nil.
        if block_id.is_nil() {
            if self.rs.locked_block.is_none() {
                debug!("precommit step; 2/3+ prevoted nil");
            } else {
                debug!("precommit step; 2/3+ prevoted nil; unlocking");
                self.unlock();
            }
            self.sign_add_vote(SignedMsgType::Precommit, Hash::ZERO, PartSetHeader::zero());
            self.new_step();
            return Ok(());
        }

        // The latest non-nil polka must be from this round.
        let pol_round = self.rs.votes.pol_info();
        if pol_round < round {
            return Err(ConsensusError::Invariant(format!(
                "polka round should be {round} but got {pol_round}"
            )));
        }

        // Already locked on this block: relock at this round.
        if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            debug!("precommit step; 2/3+ prevoted the locked block; relocking");
            self.rs.locked_round = round;
            self.bus.publish(ConsensusEvent::Lock {
                height,
                round,
                block_id,
            });
            self.sign_add_vote(SignedMsgType::Precommit, block_id.hash, block_id.parts);
            self.new_step();
            return Ok(());
        }

        // Polka for the proposal block: lock it.
        if self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            let block = self.rs.proposal_block.clone().expect("checked above");
            if let Err(reason) = block
                .validate_basic()
                .and_then(|_| self.executor.validate_block(&self.local_state, &block))
            {
                // 2/3+ of the power prevoted a block that fails validation.
                return Err(ConsensusError::Invariant(format!(
                    "precommit step; polka for an invalid block: {reason}"
                )));
            }
            debug!("precommit step; 2/3+ prevoted the proposal block; locking");
            self.rs.locked_round = round;
            self.rs.locked_block = Some(block);
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.bus.publish(ConsensusEvent::Lock {
                height,
                round,
                block_id,
            });
            self.sign_add_vote(SignedMsgType::Precommit, block_id.hash, block_id.parts);
            self.new_step();
            return Ok(());
        }

        // A polka for a block we do not have. Fetch it, unlock, and
        // precommit nil; this polka is the proof-of-lock for the unlock.
        debug!("precommit step; polka for a block we do not have; precommitting nil");
        self.unlock();
        let have_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|p| p.has_header(&block_id.parts));
        if !have_header {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
        }
        self.sign_add_vote(SignedMsgType::Precommit, Hash::ZERO, PartSetHeader::zero());
        self.new_step();
        Ok(())
    }

    /// Clear the lock and tell observers.
    fn unlock(&mut self) {
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.bus.publish(ConsensusEvent::Unlock {
            height: self.rs.height,
            round: self.rs.round,
        });
    }

    fn enter_precommit_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            debug!(
                current = %self.rs.hrs(),
                triggered = self.rs.triggered_timeout_precommit,
                "entering precommit_wait step with invalid args"
            );
            return Ok(());
        }
        if !self.rs.votes.precommits(round).has_two_thirds_any() {
            return Err(ConsensusError::Invariant(format!(
                "entering precommit_wait step ({height}/{round}) without 2/3-any precommits"
            )));
        }
        debug!(current = %self.rs.hrs(), "entering precommit_wait step");
        self.rs.triggered_timeout_precommit = true;

        // Wait for the remaining precommits.
        self.schedule_timeout(
            self.config.precommit(round),
            height,
            round,
            Step::PrecommitWait,
        );
        self.new_step();
        Ok(())
    }

    fn enter_commit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step >= Step::Commit {
            debug!(current = %self.rs.hrs(), height, round, "entering commit step with invalid args");
            return Ok(());
        }
        debug!(current = %self.rs.hrs(), "entering commit step");

        let block_id = self
            .rs
            .votes
            .precommits(round)
            .two_thirds_majority()
            .filter(|bid| !bid.is_nil())
            .ok_or_else(|| {
                ConsensusError::Invariant(format!(
                    "enter_commit({height}/{round}) expects a 2/3+ precommit majority for a block"
                ))
            })?;

        // The locked fields no longer matter. Move them over to the proposal
        // block if they match the committed hash; otherwise they are cleared
        // in update_to_state.
        if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            debug!("commit is for the locked block; adopting it as the proposal block");
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        // If we do not have the committed block, set up to fetch it and stay
        // in the commit step until the parts arrive.
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash));
        if !have_block {
            let have_header = self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&block_id.parts));
            if !have_header {
                info!("commit is for a block we do not know; waiting for its parts");
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
            }
        }

        self.update_round_step(round, Step::Commit);
        self.rs.commit_round = round;
        self.rs.commit_time = now_millis();
        self.new_step();

        // Maybe finalize immediately.
        self.try_finalize_commit(height)
    }

    fn try_finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Err(ConsensusError::Invariant(format!(
                "try_finalize_commit: rs.height={} but height={height}",
                self.rs.height
            )));
        }
        let commit_round = self.rs.commit_round;
        let block_id = self.rs.votes.precommits(commit_round).two_thirds_majority();
        let Some(block_id) = block_id.filter(|bid| !bid.is_nil()) else {
            error!("failed to finalize commit; no 2/3+ majority, or 2/3+ was for nil");
            return Ok(());
        };
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash));
        if !have_block {
            debug!("failed to finalize commit; we do not have the committed block yet");
            return Ok(());
        }
        self.finalize_commit(height)
    }

    fn finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            debug!(current = %self.rs.hrs(), "finalize commit with invalid args");
            return Ok(());
        }

        let commit_round = self.rs.commit_round;
        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .two_thirds_majority()
            .ok_or_else(|| {
                ConsensusError::Invariant(
                    "cannot finalize commit; commit does not have a 2/3 majority".to_string(),
                )
            })?;
        let block = self.rs.proposal_block.clone().ok_or_else(|| {
            ConsensusError::Invariant("cannot finalize commit; proposal block missing".to_string())
        })?;
        let parts = self.rs.proposal_block_parts.clone().ok_or_else(|| {
            ConsensusError::Invariant("cannot finalize commit; block parts missing".to_string())
        })?;

        if !parts.has_header(&block_id.parts) {
            return Err(ConsensusError::Invariant(
                "expected proposal block parts header to match the commit header".to_string(),
            ));
        }
        if !block.hashes_to(&block_id.hash) {
            return Err(ConsensusError::Invariant(
                "cannot finalize commit; proposal block does not hash to the commit hash"
                    .to_string(),
            ));
        }
        if let Err(reason) = block
            .validate_basic()
            .and_then(|_| self.executor.validate_block(&self.local_state, &block))
        {
            return Err(ConsensusError::Invariant(format!(
                "cannot finalize commit; committed block is invalid: {reason}"
            )));
        }

        info!(
            height,
            num_txs = block.txs.len(),
            hash = %block_id.hash,
            "finalizing commit of block"
        );

        let new_state = self
            .executor
            .apply_block(&self.local_state, &block_id, &block)
            .map_err(ConsensusError::Apply)?;

        self.bus.publish(ConsensusEvent::CommittedBlock {
            height,
            block: Arc::clone(&block),
        });

        // New height step.
        self.update_to_state(new_state)?;

        // The private validator may have rotated its key; refetch.
        if let Some(pv) = &self.priv_validator {
            self.priv_pub_key = Some(pv.pub_key());
        }

        // By here rs.height is height + 1, step is NewHeight, and start_time
        // says when round 0 begins.
        self.schedule_round_0();
        Ok(())
    }

    /// Reset the round state for the height after `state.last_block_height`.
    pub fn update_to_state(&mut self, state: ChainState) -> Result<(), ConsensusError> {
        if self.rs.commit_round > -1
            && self.rs.height > 0
            && self.rs.height != state.last_block_height
        {
            return Err(ConsensusError::Invariant(format!(
                "update_to_state expected state height {} but found {}",
                self.rs.height, state.last_block_height
            )));
        }

        if !self.local_state.is_empty() {
            if self.local_state.last_block_height > 0
                && self.local_state.last_block_height + 1 != self.rs.height
            {
                // Someone is mutating local_state behind our back.
                return Err(ConsensusError::Invariant(format!(
                    "inconsistent last_block_height+1={} vs rs.height={}",
                    self.local_state.last_block_height + 1,
                    self.rs.height
                )));
            }
            // If the new state is not further out, keep ours but still signal
            // the step so observers see an up-to-date view.
            if state.last_block_height <= self.local_state.last_block_height {
                debug!(
                    new_height = state.last_block_height + 1,
                    old_height = self.local_state.last_block_height + 1,
                    "ignoring update_to_state for an older height"
                );
                self.new_step();
                return Ok(());
            }
        }

        // Carry the precommits of the committed round over as last_commit.
        let last_commit = if state.last_block_height == 0 {
            // The very first commit is empty.
            None
        } else if self.rs.commit_round > -1 {
            let precommits = self.rs.votes.precommits(self.rs.commit_round);
            if !precommits.has_two_thirds_majority() {
                return Err(ConsensusError::Invariant(format!(
                    "wanted to form a commit, but precommits (H/R: {}/{}) did not have 2/3+",
                    state.last_block_height, self.rs.commit_round
                )));
            }
            Some(precommits.clone())
        } else if self.rs.last_commit.is_some() {
            self.rs.last_commit.clone()
        } else {
            return Err(ConsensusError::Invariant(format!(
                "last commit cannot be empty after initial block (height {})",
                state.last_block_height + 1
            )));
        };

        let mut height = state.last_block_height + 1;
        if height == 1 {
            height = state.initial_height;
        }

        self.rs.height = height;
        self.update_round_step(0, Step::NewHeight);
        self.rs.start_time = if self.rs.commit_time == 0 {
            now_millis() + self.config.timeout_commit.as_millis() as u64
        } else {
            self.rs.commit_time + self.config.timeout_commit.as_millis() as u64
        };

        self.rs.proposal = None;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.rs.valid_round = -1;
        self.rs.valid_block = None;
        self.rs.valid_block_parts = None;
        self.rs.votes =
            crate::HeightVoteSet::new(state.chain_id.clone(), height, state.validators.clone());
        self.rs.commit_round = -1;
        self.rs.last_commit = last_commit;
        self.rs.validators = state.validators.clone();
        self.rs.last_validators = state.last_validators.clone();
        self.rs.triggered_timeout_precommit = false;

        self.local_state = state;

        self.new_step();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message handling
    // ═══════════════════════════════════════════════════════════════════════

    fn set_proposal(&mut self, proposal: &Proposal) {
        if self.rs.proposal.is_some() {
            debug!("set_proposal; already have one");
            return;
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(
                proposal_height = proposal.height,
                proposal_round = proposal.round,
                current = %self.rs.hrs(),
                "set_proposal; does not apply"
            );
            return;
        }
        // The proof-of-lock round must be -1 or in [0, round).
        if !proposal.pol_round_valid() {
            debug!(pol_round = proposal.pol_round, "set_proposal; invalid proposal POL round");
            return;
        }
        let Some(proposer) = self.rs.validators.proposer() else {
            return;
        };
        let sign_bytes = proposal_sign_bytes(&self.local_state.chain_id, proposal);
        if !proposer.pub_key.verify(&sign_bytes, &proposal.signature) {
            debug!("set_proposal; invalid proposal signature");
            return;
        }

        self.rs.proposal = Some(proposal.clone());
        // Do not replace the part set if it is already allocated; that
        // happens when we are in the commit step or a valid block exists for
        // this round.
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts = Some(PartSet::from_header(proposal.block_id.parts));
        }
        info!(
            height = proposal.height,
            round = proposal.round,
            pol_round = proposal.pol_round,
            "received proposal"
        );
    }

    /// Add a block part; on completion, either advance to prevote (before the
    /// propose timeout) or try to finalize the commit.
    ///
    /// The block may still be invalid.
    fn add_proposal_block_part(
        &mut self,
        msg: &BlockPartMessage,
        peer_id: &str,
    ) -> Result<bool, ConsensusError> {
        let height = msg.height;
        let round = msg.round;

        // Blocks can be reused across rounds, so a round mismatch is fine;
        // a height mismatch is not.
        if self.rs.height != height {
            debug!(height, round, "received block part for a different height");
            return Ok(false);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // We have moved to a higher round and this part belongs to a
            // prior one; not necessarily a bad peer.
            debug!(height, round, peer_id, "received block part while not expecting any");
            return Ok(false);
        };

        let added = parts.add_part(msg.part.clone());
        if parts.byte_size() > self.local_state.consensus_params.block.max_bytes {
            error!(
                byte_size = parts.byte_size(),
                max_bytes = self.local_state.consensus_params.block.max_bytes,
                "total size of proposal block parts exceeds the block byte limit"
            );
            return Ok(added);
        }
        if !added || !parts.is_complete() {
            return Ok(added);
        }

        let Some(block) = parts.block() else {
            // All proofs verified yet the bytes do not decode: the proposer
            // equivocated on the part-set root contents.
            error!(height, "completed part set does not decode into a block");
            return Ok(added);
        };
        info!(height, hash = %block.hash(), "received complete proposal block");
        self.rs.proposal_block = Some(Arc::new(block));

        // Update the valid block if this round has a polka for it.
        let current_round = self.rs.round;
        let maj = self.rs.votes.prevotes(current_round).two_thirds_majority();
        if let Some(block_id) = maj.filter(|bid| !bid.is_nil()) {
            if self.rs.valid_round < current_round
                && self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&block_id.hash))
            {
                debug!("updating valid block to the new proposal block");
                self.rs.valid_round = current_round;
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            }
        }

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            // Move to the next step.
            self.enter_prevote(height, current_round)?;
            if maj.is_some() {
                self.enter_precommit(height, current_round)?;
            }
        } else if self.rs.step == Step::Commit {
            // We were waiting on this block to finish the commit.
            self.try_finalize_commit(height)?;
        }
        Ok(added)
    }

    /// Add a vote, logging and absorbing per-peer errors. A conflicting vote
    /// is surfaced as evidence and otherwise dropped; only invariant
    /// violations from chained transitions propagate.
    fn try_add_vote(&mut self, vote: &Vote, peer_id: &str) -> Result<(), ConsensusError> {
        self.add_vote(vote, peer_id).map(|_added| ())
    }

    fn add_vote(&mut self, vote: &Vote, peer_id: &str) -> Result<bool, ConsensusError> {
        debug!(
            height = vote.height,
            round = vote.round,
            vote_type = %vote.vote_type,
            index = vote.validator_index,
            cs_height = self.rs.height,
            "adding vote"
        );

        // A precommit for the previous height. These arrive while we wait
        // out timeout_commit.
        if vote.height + 1 == self.rs.height && vote.vote_type == SignedMsgType::Precommit {
            if self.rs.step != Step::NewHeight {
                debug!("precommit for previous height arrived after commit timeout; ignored");
                return Ok(false);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                debug!("no last commit to add the late precommit to");
                return Ok(false);
            };
            match last_commit.add_vote(vote.clone()) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(err) => {
                    debug!(%err, peer_id, "late precommit not added");
                    return Ok(false);
                }
            }
            debug!("added vote to last precommits");
            // Skip timeout_commit when every validator has precommitted.
            if self.config.skip_timeout_commit && self.rs.last_commit.as_ref().unwrap().has_all() {
                self.enter_new_round(self.rs.height, 0)?;
            }
            return Ok(false);
        }

        // Height mismatch is ignored; not necessarily a bad peer, but not
        // favorable behavior.
        if vote.height != self.rs.height {
            debug!(
                vote_height = vote.height,
                cs_height = self.rs.height,
                peer_id,
                "vote ignored and not added"
            );
            return Ok(false);
        }

        let height = self.rs.height;
        match self.rs.votes.add_vote(vote.clone(), peer_id) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(VoteError::Conflicting { existing }) => {
                // Evidence of double-signing; the stored vote is retained.
                warn!(
                    height = vote.height,
                    round = vote.round,
                    index = vote.validator_index,
                    existing_block = ?existing.block_id.hash,
                    conflicting_block = ?vote.block_id.hash,
                    "conflicting vote; surfacing as evidence"
                );
                return Ok(false);
            }
            Err(err) => {
                debug!(%err, peer_id, "vote not added");
                return Ok(false);
            }
        }

        match vote.vote_type {
            SignedMsgType::Prevote => self.on_prevote_added(height, vote)?,
            SignedMsgType::Precommit => self.on_precommit_added(height, vote)?,
        }
        Ok(true)
    }

    fn on_prevote_added(&mut self, height: Height, vote: &Vote) -> Result<(), ConsensusError> {
        debug!("added vote to prevotes");
        let (maj, has_any) = {
            let prevotes = self.rs.votes.prevotes(vote.round);
            (prevotes.two_thirds_majority(), prevotes.has_two_thirds_any())
        };

        if let Some(block_id) = maj {
            // There was a polka.
            // Unlock if `locked_round < vote.round <= rs.round` and the polka
            // is for a different block. (For polkas beyond rs.round we deal
            // with it when we reach that round.)
            if self.rs.locked_round < vote.round
                && vote.round <= self.rs.round
                && self
                    .rs
                    .locked_block
                    .as_ref()
                    .is_some_and(|b| !b.hashes_to(&block_id.hash))
            {
                debug!(
                    locked_round = self.rs.locked_round,
                    pol_round = vote.round,
                    "unlocking because of a later polka"
                );
                self.unlock();
            }

            // Update the valid block if the polka is for a non-nil block in
            // the current round. Our proposal block may be absent or not the
            // polka block.
            if !block_id.hash.is_zero()
                && self.rs.valid_round < vote.round
                && vote.round == self.rs.round
            {
                if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&block_id.hash))
                {
                    debug!(
                        valid_round = vote.round,
                        "updating valid block because of a polka"
                    );
                    self.rs.valid_round = vote.round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    debug!("polka for a block we do not have; clearing the proposal block");
                    self.rs.proposal_block = None;
                }
                let have_header = self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .is_some_and(|p| p.has_header(&block_id.parts));
                if !have_header {
                    self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
                }
            }
        }

        if self.rs.round < vote.round && has_any {
            // Round-skip: 2/3+ of the power is voting in a future round.
            self.enter_new_round(height, vote.round)?;
        } else if self.rs.round == vote.round && self.rs.step >= Step::Prevote {
            if let Some(block_id) = maj {
                if self.is_proposal_complete() || block_id.is_nil() {
                    self.enter_precommit(height, vote.round)?;
                } else if has_any {
                    self.enter_prevote_wait(height, vote.round)?;
                }
            } else if has_any {
                self.enter_prevote_wait(height, vote.round)?;
            }
        } else if let Some(proposal) = self.rs.proposal.clone() {
            // The proposal's proof-of-lock may have just completed.
            if proposal.pol_round >= 0 && proposal.pol_round == vote.round {
                let current_round = self.rs.round;
                if self.is_proposal_complete() {
                    self.enter_prevote(height, current_round)?;
                }
            }
        }
        Ok(())
    }

    fn on_precommit_added(&mut self, height: Height, vote: &Vote) -> Result<(), ConsensusError> {
        debug!("added vote to precommits");
        let (maj, has_any, has_all) = {
            let precommits = self.rs.votes.precommits(vote.round);
            (
                precommits.two_thirds_majority(),
                precommits.has_two_thirds_any(),
                precommits.has_all(),
            )
        };

        if let Some(block_id) = maj {
            // The majority may be from a higher round than ours.
            self.enter_new_round(height, vote.round)?;
            self.enter_precommit(height, vote.round)?;

            if !block_id.is_nil() {
                self.enter_commit(height, vote.round)?;
                if self.config.skip_timeout_commit && has_all {
                    self.enter_new_round(self.rs.height, 0)?;
                }
            } else {
                self.enter_precommit_wait(height, vote.round)?;
            }
        } else if self.rs.round <= vote.round && has_any {
            self.enter_new_round(height, vote.round)?;
            self.enter_precommit_wait(height, vote.round)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Voting
    // ═══════════════════════════════════════════════════════════════════════

    /// Sign a vote for `(hash, parts_header)` at the current height/round.
    ///
    /// Returns `None` when this node has no usable validator key, is not in
    /// the set, or the signer refuses (monotonicity or timeout); the step
    /// then proceeds without a vote.
    fn sign_vote(
        &mut self,
        vote_type: SignedMsgType,
        hash: Hash,
        parts_header: PartSetHeader,
    ) -> Option<Vote> {
        let pub_key = self.priv_pub_key?;
        let address = pub_key.address();
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            error!("sign_vote failed: unable to determine validator index");
            return None;
        };

        let block_id = if hash.is_zero() {
            BlockId::nil()
        } else {
            BlockId {
                hash,
                parts: parts_header,
            }
        };
        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.vote_time(),
            validator_address: address,
            validator_index: index,
            signature: basalt_types::Signature::zero(),
            extension: None,
        };

        let pv = self.priv_validator.as_ref()?;
        match pv.sign_vote(&self.local_state.chain_id, &mut vote) {
            Ok(()) => Some(vote),
            Err(err) => {
                warn!(%err, vote_type = %vote_type, "failed signing vote");
                None
            }
        }
    }

    /// Vote timestamps are monotonic: at least 1ms after the BFT time of the
    /// block being voted on (locked first, else proposal).
    fn vote_time(&self) -> Timestamp {
        let now = now_millis();
        let min_vote_time = if let Some(block) = &self.rs.locked_block {
            block.header.time + 1
        } else if let Some(block) = &self.rs.proposal_block {
            block.header.time + 1
        } else {
            now
        };
        now.max(min_vote_time)
    }

    /// Sign a vote and publish it on the internal message queue. The normal
    /// receive path then admits it into the vote sets.
    fn sign_add_vote(&mut self, vote_type: SignedMsgType, hash: Hash, parts_header: PartSetHeader) {
        if self.priv_validator.is_none() {
            return;
        }
        let Some(pub_key) = self.priv_pub_key else {
            // The vote will not be signed, but that is not critical.
            error!("sign_add_vote: private validator public key is not set");
            return;
        };
        // Not in the validator set: nothing to do.
        if !self.rs.validators.has_address(&pub_key.address()) {
            return;
        }

        if let Some(vote) = self.sign_vote(vote_type, hash, parts_header) {
            self.publish_internal(ConsensusMessage::Vote(VoteMessage::new(vote)));
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                vote_type = %vote_type,
                "signed and pushed vote"
            );
        } else {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                vote_type = %vote_type,
                "failed signing vote"
            );
        }
    }

    fn publish_internal(&self, msg: ConsensusMessage) {
        if self.internal_tx.send(MessageInfo::internal(msg)).is_err() {
            warn!("internal message queue receiver dropped");
        }
    }
}

fn commit_hash(commit: &Commit) -> Hash {
    let encoded = sbor::basic_encode(commit).expect("commit encoding cannot fail");
    Hash::from_bytes(&encoded)
}
