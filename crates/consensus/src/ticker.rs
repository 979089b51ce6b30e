//! The timeout ticker.
//!
//! A monotonic single-slot scheduler: at most one `(height, round, step)`
//! timeout is armed at a time. Scheduling a newer timeout cancels the
//! pending one; scheduling an older one is ignored. The ticker is the only
//! scheduler of step timeouts.

use crate::Step;
use basalt_types::{Height, Round};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A scheduled step timeout. Ordered lexicographically by
/// `(height, round, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    /// How long to wait before firing.
    pub duration: Duration,
    /// Height the timeout applies to.
    pub height: Height,
    /// Round the timeout applies to.
    pub round: Round,
    /// Step the timeout applies to.
    pub step: Step,
}

impl TimeoutInfo {
    fn key(&self) -> (Height, Round, Step) {
        (self.height, self.round, self.step)
    }
}

struct TickerInner {
    /// The most recently armed timeout. Compared against incoming schedules
    /// for staleness and against firing callbacks for cancellation.
    old_ti: Option<TimeoutInfo>,
    /// Handle of the armed timer task.
    handle: Option<JoinHandle<()>>,
}

/// Monotonic single-slot timeout scheduler.
///
/// Fired timeouts are delivered on the channel given at construction; the
/// receiver hands them to `ConsensusCore::handle_timeout`.
#[derive(Clone)]
pub struct TimeoutTicker {
    inner: Arc<Mutex<TickerInner>>,
    tock_tx: mpsc::UnboundedSender<TimeoutInfo>,
}

impl TimeoutTicker {
    /// Create a ticker delivering fired timeouts to `tock_tx`.
    pub fn new(tock_tx: mpsc::UnboundedSender<TimeoutInfo>) -> Self {
        TimeoutTicker {
            inner: Arc::new(Mutex::new(TickerInner {
                old_ti: None,
                handle: None,
            })),
            tock_tx,
        }
    }

    /// Schedule a timeout.
    ///
    /// Ignored when `ti` is not newer than the pending timeout. Otherwise the
    /// pending timer is cancelled (its callback will not deliver) and a new
    /// timer is armed for `ti.duration`.
    pub fn schedule(&self, ti: TimeoutInfo) {
        let mut inner = self.inner.lock();

        if let Some(old) = &inner.old_ti {
            if ti.key() <= old.key() {
                trace!(?ti, ?old, "ignoring stale timeout");
                return;
            }
        }

        if let Some(handle) = inner.handle.take() {
            handle.abort();
            debug!("cancelled pending timeout");
        }

        inner.old_ti = Some(ti);
        let tx = self.tock_tx.clone();
        let inner_ref = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ti.duration).await;
            // Deliver only if this is still the armed timeout. An aborted
            // task normally never reaches here, but the abort can race the
            // sleep completing.
            {
                let inner = inner_ref.lock();
                if inner.old_ti != Some(ti) {
                    return;
                }
            }
            trace!(?ti, "timeout fired");
            if tx.send(ti).is_err() {
                warn!("timeout receiver dropped");
            }
        });
        inner.handle = Some(handle);
        debug!(
            height = ti.height,
            round = ti.round,
            step = %ti.step,
            duration_ms = ti.duration.as_millis() as u64,
            "scheduled timeout"
        );
    }

    /// Cancel the pending timeout, if any. Used at shutdown.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn ti(height: Height, round: Round, step: Step, millis: u64) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(millis),
            height,
            round,
            step,
        }
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = TimeoutTicker::new(tx);
        ticker.schedule(ti(1, 0, Step::Propose, 10));

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timer should fire")
            .expect("channel open");
        assert_eq!(fired.height, 1);
        assert_eq!(fired.step, Step::Propose);
    }

    #[tokio::test]
    async fn test_newer_schedule_cancels_older() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = TimeoutTicker::new(tx);
        // Long timer, then replace with a short, newer one.
        ticker.schedule(ti(1, 0, Step::Propose, 5_000));
        ticker.schedule(ti(1, 0, Step::Prevote, 10));

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("replacement timer should fire")
            .expect("channel open");
        assert_eq!(fired.step, Step::Prevote);

        // The cancelled timer must never deliver.
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_schedule_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = TimeoutTicker::new(tx);
        ticker.schedule(ti(2, 1, Step::Prevote, 30));
        // Older in every dimension: must not replace the armed timer.
        ticker.schedule(ti(1, 0, Step::Propose, 1));
        ticker.schedule(ti(2, 0, Step::Precommit, 1));
        ticker.schedule(ti(2, 1, Step::Propose, 1));

        let fired = timeout(Duration::from_millis(300), rx.recv())
            .await
            .expect("original timer should fire")
            .expect("channel open");
        assert_eq!(fired.key(), (2, 1, Step::Prevote));
    }

    #[tokio::test]
    async fn test_at_most_one_fire_per_schedule() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = TimeoutTicker::new(tx);
        ticker.schedule(ti(1, 0, Step::Propose, 5));
        ticker.schedule(ti(1, 0, Step::Prevote, 10));
        ticker.schedule(ti(1, 0, Step::Precommit, 15));

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("latest timer fires")
            .expect("channel open");
        assert_eq!(fired.step, Step::Precommit);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = TimeoutTicker::new(tx);
        ticker.schedule(ti(1, 0, Step::Propose, 20));
        ticker.stop();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }
}
