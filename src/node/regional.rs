//! The second ring tier.
//!
//! A [`RegionalNode`] is a [`PeerNode`] that also belongs to a ring of rings:
//! besides its local neighbor it has a regional neighbor, the representative
//! of another local ring. Regional balancing only kicks in once the local
//! ring has nothing to say.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, Instrument};

use super::{scheduler::jittered, PeerNode, TickOutcome};
use crate::{
    checkpoint::NodeSnapshot,
    error::Result,
    net::{Request, Response, Service},
    ring::traverse,
};

pub struct RegionalNode {
    node: Arc<PeerNode>,
    regional_next: RwLock<Option<String>>,
}

impl RegionalNode {
    pub fn new(node: Arc<PeerNode>, regional_next: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            node,
            regional_next: RwLock::new(regional_next),
        })
    }

    pub fn node(&self) -> &Arc<PeerNode> {
        &self.node
    }

    pub fn regional_next(&self) -> Option<String> {
        self.regional_next.read().clone()
    }

    pub fn set_regional_next(&self, address: impl Into<String>) {
        let address = address.into();
        debug!(node = %self.node.info(), regional_next = %address, "regional neighbor rebound");
        *self.regional_next.write() = Some(address);
    }

    /// Total queue depth of this node's local ring.
    pub async fn regional_queue_depth(&self) -> Result<usize> {
        let me = self.node.address();
        let client = self.node.client().clone();
        let cap = self.node.options().traversal_cap;
        traverse(client.clone(), me.clone(), cap)
            .try_fold(0usize, |total, member| {
                let client = client.clone();
                let local = me == member;
                let node = self.node.clone();
                async move {
                    let depth = if local {
                        node.queue_depth().await
                    } else {
                        client.queue_depth(&member).await?
                    };
                    Ok(total + depth)
                }
            })
            .await
    }

    /// One regional balancing pass.
    ///
    /// Local first: if the node would move work to its local neighbor this
    /// pass defers. Otherwise it moves half its queue to the regional
    /// neighbor when both its own depth and its ring's total exceed
    /// `threshold` times the regional neighbor's.
    ///
    /// Shares the node's transfer slot with the local scheduler, so it returns
    /// [`TickOutcome::Busy`] while a local transfer is in flight.
    pub async fn regional_tick(&self) -> TickOutcome {
        let me = self.node.address();
        let target = match self.regional_next() {
            Some(target) if target != me => target,
            _ => return TickOutcome::Skipped,
        };
        self.node.exclusive(self.regional_pass(&me, &target)).await
    }

    async fn regional_pass(&self, me: &str, target: &str) -> TickOutcome {
        let client = self.node.client();
        let policy = self.node.options().policy();

        let local_next = self.node.neighbor();
        if local_next != *me {
            if let Ok(depth) = client.queue_depth(&local_next).await {
                let own = self.node.queue_depth().await;
                if policy.surplus(own, depth).is_some() {
                    debug!(node = %self.node.info(), "local ring goes first");
                    return TickOutcome::Deferred;
                }
            }
        }

        let neighbor = match client.queue_depth(target).await {
            Ok(depth) => depth,
            Err(e) => return self.node.transfer_failed(target, e).await,
        };
        let own = self.node.queue_depth().await;
        let Some(count) = policy.surplus(own, neighbor) else {
            return TickOutcome::Stable {
                local: own,
                neighbor,
            };
        };

        let ring_total = match self.regional_queue_depth().await {
            Ok(total) => total,
            Err(e) => {
                debug!(error = %e, "cannot total local ring");
                return TickOutcome::Failed;
            }
        };
        let neighbor_total = match client.regional_queue_depth(target).await {
            Ok(total) => total,
            Err(e) => return self.node.transfer_failed(target, e).await,
        };
        if !policy.exceeds(ring_total, neighbor_total) {
            return TickOutcome::Stable {
                local: ring_total,
                neighbor: neighbor_total,
            };
        }
        self.node.push_units(target, count).await
    }

    /// Runs [`RegionalNode::regional_tick`] forever on the regional interval.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let regional = self.clone();
        let span = debug_span!("regional", node = %regional.node.info());
        tokio::spawn(
            async move {
                let options = regional.node.options().clone();
                loop {
                    tokio::time::sleep(jittered(options.regional_tick_interval, options.jitter)).await;
                    let outcome = regional.regional_tick().await;
                    debug!(?outcome, "regional tick");
                }
            }
            .instrument(span),
        )
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            regional_next: self.regional_next(),
            ..self.node.snapshot().await
        }
    }
}

#[async_trait]
impl Service for RegionalNode {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::RegionalQueueDepth => match self.regional_queue_depth().await {
                Ok(total) => Response::Depth(total as u64),
                Err(e) => Response::Rejected(e.to_string()),
            },
            Request::SetRegionalNext(next) => {
                self.set_regional_next(next);
                Response::Ack
            }
            other => self.node.handle(other).await,
        }
    }
}
