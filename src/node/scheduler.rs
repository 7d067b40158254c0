use std::{
    future::Future,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::PeerNode;
use crate::{
    codec::{Blob, CodecPolicy},
    error::Error,
    net::TransportError,
    work::WorkUnit,
};

/// Decides how much work to move to a neighbor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadPolicy {
    pub threshold: f64,
}

impl LoadPolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// True if `local` is more than `threshold` times `neighbor`.
    pub fn exceeds(&self, local: usize, neighbor: usize) -> bool {
        local as f64 > self.threshold * neighbor as f64
    }

    /// Number of units to move, if any: half the local queue, rounded down.
    pub fn surplus(&self, local: usize, neighbor: usize) -> Option<usize> {
        let half = local / 2;
        (half > 0 && self.exceeds(local, neighbor)).then_some(half)
    }
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self::new(1.25)
    }
}

/// Where the balancing state machine is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    /// Comparing depths with the neighbor.
    Evaluating,
    /// A transfer is in flight.
    Overloaded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to move.
    Stable { local: usize, neighbor: usize },
    Transferred { moved: usize, remaining: usize },
    /// Locally owned surplus is handled by the local ring first.
    Deferred,
    /// No neighbor to balance with.
    Skipped,
    /// The neighbor could not be reached or refused the units. Nothing left
    /// the queue.
    Failed,
    /// Another transfer from this node is still in flight.
    Busy,
}

impl PeerNode {
    /// One pass of the balancing state machine against the ring neighbor.
    pub async fn tick(&self) -> TickOutcome {
        let next = self.neighbor();
        if next == self.address() {
            return TickOutcome::Skipped;
        }
        self.balance_with(&next).await
    }

    /// Compares depths with `target` and pushes the surplus there if the
    /// policy says so.
    pub(crate) async fn balance_with(&self, target: &str) -> TickOutcome {
        self.exclusive(async {
            let neighbor = match self.client.queue_depth(target).await {
                Ok(depth) => depth,
                Err(e) => return self.transfer_failed(target, e).await,
            };
            let local = self.queue_depth().await;
            match self.options.policy().surplus(local, neighbor) {
                Some(count) => self.push_units(target, count).await,
                None => {
                    self.counters.consecutive_failures.store(0, Ordering::Relaxed);
                    TickOutcome::Stable { local, neighbor }
                }
            }
        })
        .await
    }

    /// Runs one balancing pass, or returns [`TickOutcome::Busy`] if another
    /// pass holds the node. At most one migration per node is in flight.
    pub(crate) async fn exclusive<F>(&self, pass: F) -> TickOutcome
    where
        F: Future<Output = TickOutcome>,
    {
        {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Idle {
                return TickOutcome::Busy;
            }
            state.phase = Phase::Evaluating;
        }
        let outcome = pass.await;
        self.state.lock().await.phase = Phase::Idle;
        outcome
    }

    /// Takes the first `count` queued units out of the queue and sends them
    /// to `target`. If the transfer fails they go back to the front of the
    /// queue in their original order.
    pub(crate) async fn push_units(&self, target: &str, count: usize) -> TickOutcome {
        let units: Vec<WorkUnit> = {
            let mut state = self.state.lock().await;
            let count = count.min(state.queue.len());
            let units: Vec<WorkUnit> = state.queue.drain(..count).collect();
            state.in_flight.extend(units.iter().cloned());
            state.phase = Phase::Overloaded;
            units
        };
        if units.is_empty() {
            return TickOutcome::Skipped;
        }

        if let Err(e) = self.send_units(target, &units).await {
            self.requeue(units).await;
            return self.transfer_failed(target, e).await;
        }

        let remaining = {
            let mut state = self.state.lock().await;
            state.in_flight.clear();
            state.queue.len()
        };
        self.counters.consecutive_failures.store(0, Ordering::Relaxed);
        self.counters
            .units_sent
            .fetch_add(units.len() as u64, Ordering::Relaxed);
        info!(node = %self.info(), %target, moved = units.len(), remaining, "transferred surplus");
        TickOutcome::Transferred {
            moved: units.len(),
            remaining,
        }
    }

    async fn send_units(&self, target: &str, units: &[WorkUnit]) -> Result<(), TransportError> {
        let recipient = match self.options.codec {
            CodecPolicy::Obfuscate => None,
            CodecPolicy::Seal => {
                let identity = self.client.info(target).await?;
                if !identity.validate_self_id() {
                    return Err(TransportError::Rejected("identity does not match its key".into()));
                }
                Some(identity)
            }
        };
        let blob = Blob::pack(self.options.codec, recipient.as_ref(), units).map_err(|e| {
            warn!(node = %self.info(), %target, error = %e, "could not pack surplus");
            TransportError::CouldNotEncodeMessage
        })?;
        self.client.balance(target, blob).await
    }

    async fn requeue(&self, units: Vec<WorkUnit>) {
        let mut state = self.state.lock().await;
        state.in_flight.clear();
        let rest = std::mem::replace(&mut state.queue, units);
        state.queue.extend(rest);
    }

    pub(crate) async fn transfer_failed(&self, target: &str, source: TransportError) -> TickOutcome {
        let failures = self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.transfer_failures.fetch_add(1, Ordering::Relaxed);
        let err = Error::TransferFailure {
            peer: target.to_string(),
            source,
        };
        warn!(node = %self.info(), consecutive = failures, "{}", err);
        TickOutcome::Failed
    }

    /// Runs [`PeerNode::tick`] forever, sleeping a jittered interval before
    /// each pass.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        let span = debug_span!("scheduler", node = %node.info());
        tokio::spawn(
            async move {
                loop {
                    let pause = jittered(node.options.tick_interval, node.options.jitter);
                    tokio::time::sleep(pause).await;
                    let outcome = node.tick().await;
                    debug!(?outcome, "tick");
                }
            }
            .instrument(span),
        )
    }
}

/// `base` scaled by a factor drawn uniformly from `[low, high)`.
pub(crate) fn jittered(base: Duration, (low, high): (f64, f64)) -> Duration {
    let factor = if high > low {
        rand::thread_rng().gen_range(low..high)
    } else {
        low
    };
    base.mul_f64(factor.max(0.0))
}
