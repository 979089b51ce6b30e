//! Consensus event bus.
//!
//! Observers (RPC, reactors, tests) subscribe to step transitions and
//! committed blocks. The bus is injected into the core at construction; the
//! core never reaches for process-wide state.

use crate::Step;
use basalt_types::{Block, BlockId, Height, Round};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events published by the consensus core, in transition order.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// The round state advanced to a new `(height, round, step)`.
    NewRoundStep {
        height: Height,
        round: Round,
        step: Step,
    },
    /// The node locked on a block.
    Lock {
        height: Height,
        round: Round,
        block_id: BlockId,
    },
    /// The node released its lock.
    Unlock { height: Height, round: Round },
    /// A block was finalized and applied.
    CommittedBlock {
        height: Height,
        block: Arc<Block>,
    },
}

/// Broadcast channel for consensus events.
///
/// Publishing never blocks; events are dropped when no subscriber is
/// listening or a subscriber lags.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConsensusEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means nobody is subscribed.
    pub fn publish(&self, event: ConsensusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(ConsensusEvent::NewRoundStep {
            height: 1,
            round: 0,
            step: Step::NewRound,
        });
        bus.publish(ConsensusEvent::NewRoundStep {
            height: 1,
            round: 0,
            step: Step::Propose,
        });

        match rx.recv().await.unwrap() {
            ConsensusEvent::NewRoundStep { step, .. } => assert_eq!(step, Step::NewRound),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ConsensusEvent::NewRoundStep { step, .. } => assert_eq!(step, Step::Propose),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(ConsensusEvent::Unlock {
            height: 1,
            round: 2,
        });
    }
}
