//! Ring members.
//!
//! A [`PeerNode`] owns a queue of work units, knows exactly one outbound
//! neighbor by address and answers the RPC surface in [`crate::net`]. Its
//! queue, processed-round set and scheduler phase sit behind one async mutex,
//! which is never held across a network call or a unit execution.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashSet;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};
use typed_builder::TypedBuilder;

use crate::{
    checkpoint::NodeSnapshot,
    codec::{Blob, CodecPolicy},
    engine::ExecutionEngine,
    error::Error,
    identity::{Keypair, NodeIdentity},
    net::{PeerClient, Request, Response, Service},
    work::{ContextFrame, Contribution, ExecutionContext, RoundId, UnitOutcome, WorkUnit},
};

pub mod regional;
mod scheduler;

pub use regional::RegionalNode;
pub use scheduler::{LoadPolicy, Phase, TickOutcome};

/// Tunables shared by every node of a deployment.
#[derive(TypedBuilder, Clone, Debug)]
pub struct NodeOptions {
    /// A node moves work once its depth exceeds `threshold` times its
    /// neighbor's.
    #[builder(default = 1.25)]
    pub threshold: f64,
    #[builder(default = Duration::from_secs(15))]
    pub tick_interval: Duration,
    /// Every scheduler sleep is `tick_interval` scaled by a factor drawn
    /// uniformly from this range.
    #[builder(default = (0.5, 1.5))]
    pub jitter: (f64, f64),
    #[builder(default = Duration::from_secs(120))]
    pub regional_tick_interval: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub rpc_timeout: Duration,
    /// Longest walk a traversal may take before the ring counts as broken.
    #[builder(default = 1024)]
    pub traversal_cap: usize,
    #[builder(default)]
    pub codec: CodecPolicy,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl NodeOptions {
    pub fn policy(&self) -> LoadPolicy {
        LoadPolicy::new(self.threshold)
    }
}

/// Point-in-time copy of a node's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub consecutive_failures: u64,
    pub transfer_failures: u64,
    pub units_sent: u64,
    pub units_received: u64,
    pub undecodable_dropped: u64,
    pub rounds_executed: u64,
}

#[derive(Default)]
struct Counters {
    consecutive_failures: AtomicU64,
    transfer_failures: AtomicU64,
    units_sent: AtomicU64,
    units_received: AtomicU64,
    undecodable_dropped: AtomicU64,
    rounds_executed: AtomicU64,
}

struct NodeState {
    queue: Vec<WorkUnit>,
    /// Units taken out of the queue by the transfer in flight.
    in_flight: Vec<WorkUnit>,
    processed: HashSet<RoundId>,
    phase: Phase,
}

pub struct PeerNode {
    me: Weak<PeerNode>,
    identity: RwLock<NodeIdentity>,
    keypair: Option<Keypair>,
    next: RwLock<String>,
    state: Mutex<NodeState>,
    client: PeerClient,
    engine: Arc<dyn ExecutionEngine>,
    options: NodeOptions,
    counters: Counters,
}

impl PeerNode {
    /// Creates a node answering on `address`. It starts as a ring of one:
    /// its neighbor is itself. Under [`CodecPolicy::Seal`] the node gets a
    /// fresh keypair and a keyed identity.
    pub fn new(
        address: impl Into<String>,
        client: PeerClient,
        engine: Arc<dyn ExecutionEngine>,
        options: NodeOptions,
    ) -> Arc<Self> {
        let address = address.into();
        let (identity, keypair) = match options.codec {
            CodecPolicy::Obfuscate => (NodeIdentity::anonymous(address.clone()), None),
            CodecPolicy::Seal => {
                let keypair = Keypair::generate();
                (NodeIdentity::keyed(address.clone(), &keypair), Some(keypair))
            }
        };
        Self::assemble(identity, keypair, address, Vec::new(), client, engine, options)
    }

    /// Recreates a node from a checkpoint snapshot. Secret keys are never
    /// checkpointed, so a sealing node comes back with a new keypair and
    /// therefore a new id.
    pub fn restore(
        snapshot: NodeSnapshot,
        client: PeerClient,
        engine: Arc<dyn ExecutionEngine>,
        options: NodeOptions,
    ) -> Arc<Self> {
        let NodeSnapshot {
            mut identity,
            next,
            queue,
            ..
        } = snapshot;
        let keypair = match options.codec {
            CodecPolicy::Obfuscate => {
                identity.public_key = None;
                None
            }
            CodecPolicy::Seal => {
                let keypair = Keypair::generate();
                identity = NodeIdentity::keyed(identity.address, &keypair);
                Some(keypair)
            }
        };
        Self::assemble(identity, keypair, next, queue, client, engine, options)
    }

    fn assemble(
        identity: NodeIdentity,
        keypair: Option<Keypair>,
        next: String,
        queue: Vec<WorkUnit>,
        client: PeerClient,
        engine: Arc<dyn ExecutionEngine>,
        options: NodeOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            identity: RwLock::new(identity),
            keypair,
            next: RwLock::new(next),
            state: Mutex::new(NodeState {
                queue,
                in_flight: Vec::new(),
                processed: HashSet::new(),
                phase: Phase::Idle,
            }),
            client,
            engine,
            options,
            counters: Counters::default(),
        })
    }

    pub fn info(&self) -> NodeIdentity {
        self.identity.read().clone()
    }

    pub fn address(&self) -> String {
        self.identity.read().address.clone()
    }

    pub fn keypair(&self) -> Option<&Keypair> {
        self.keypair.as_ref()
    }

    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub async fn queue_depth(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Names of the queued units, in queue order.
    pub async fn queued(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.queue.iter().map(|unit| unit.name.clone()).collect()
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub fn neighbor(&self) -> String {
        self.next.read().clone()
    }

    /// Rebinds the outbound neighbor. In-flight calls keep their target.
    pub fn set_next(&self, address: impl Into<String>) {
        let address = address.into();
        debug!(node = %self.info(), next = %address, "neighbor rebound");
        *self.next.write() = address;
    }

    /// Moves the node to a new address. A node that was its own neighbor
    /// stays its own neighbor.
    pub fn rebind(&self, address: impl Into<String>) {
        let address = address.into();
        let old = std::mem::replace(&mut self.identity.write().address, address.clone());
        let mut next = self.next.write();
        if *next == old {
            *next = address;
        }
    }

    /// Adds units to the queue. Administrative; nothing goes on the wire.
    pub async fn prime(&self, units: impl IntoIterator<Item = WorkUnit>) -> usize {
        let mut state = self.state.lock().await;
        state.queue.extend(units);
        state.queue.len()
    }

    /// Removes every unit whose name is in `names`, returning how many went.
    pub async fn purge(&self, names: &[String]) -> usize {
        let mut state = self.state.lock().await;
        let before = state.queue.len();
        state.queue.retain(|unit| !names.contains(&unit.name));
        before - state.queue.len()
    }

    pub fn stats(&self) -> NodeStats {
        let c = &self.counters;
        NodeStats {
            consecutive_failures: c.consecutive_failures.load(Ordering::Relaxed),
            transfer_failures: c.transfer_failures.load(Ordering::Relaxed),
            units_sent: c.units_sent.load(Ordering::Relaxed),
            units_received: c.units_received.load(Ordering::Relaxed),
            undecodable_dropped: c.undecodable_dropped.load(Ordering::Relaxed),
            rounds_executed: c.rounds_executed.load(Ordering::Relaxed),
        }
    }

    /// Units still in flight are included: until the neighbor acknowledges
    /// them they belong to this node.
    pub async fn snapshot(&self) -> NodeSnapshot {
        let queue = {
            let state = self.state.lock().await;
            state.in_flight.iter().chain(&state.queue).cloned().collect()
        };
        NodeSnapshot {
            identity: self.info(),
            next: self.neighbor(),
            regional_next: None,
            queue,
        }
    }

    /// Enqueues every entry of `blob` this node can decode and drops the
    /// rest. Returns the new depth.
    async fn merge(&self, blob: Blob) -> usize {
        let opened = blob.open(self.keypair.as_ref());
        if opened.undecodable > 0 {
            let err = Error::DecodeMismatch;
            debug!(node = %self.info(), dropped = opened.undecodable, "{}", err);
            self.counters
                .undecodable_dropped
                .fetch_add(opened.undecodable as u64, Ordering::Relaxed);
        }
        let received = opened.units.len();
        self.counters
            .units_received
            .fetch_add(received as u64, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        state.queue.extend(opened.units);
        debug!(received, foreign = opened.foreign, depth = state.queue.len(), "merged blob");
        state.queue.len()
    }

    /// Takes in a blob from anyone. A blob with nothing this node can decode
    /// is a request: the node then checks, in the background, whether it
    /// should push surplus to the sender (or to its neighbor if the sender
    /// left no address).
    pub async fn receive_blob(&self, blob: Blob) {
        if blob.resolvable(self.keypair.as_ref()) > 0 {
            self.merge(blob).await;
            return;
        }
        let target = blob
            .reply_to()
            .map(str::to_owned)
            .unwrap_or_else(|| self.neighbor());
        let Some(node) = self.me.upgrade() else {
            return;
        };
        debug!(node = %self.info(), %target, "work requested");
        tokio::spawn(
            async move {
                let outcome = node.balance_with(&target).await;
                debug!(?outcome, "answered work request");
            }
            .in_current_span(),
        );
    }

    /// Accepts surplus pushed by a neighbor.
    pub async fn balance(&self, blob: Blob) -> usize {
        let depth = self.merge(blob).await;
        info!(node = %self.info(), depth, "accepted surplus");
        depth
    }

    /// Executes the round on this node, then relays it to the neighbor.
    ///
    /// Returns `None` if the round was already processed here. Otherwise
    /// returns the context as it came back from downstream, or this node's
    /// own context if nothing came back.
    pub async fn run(&self, frame: ContextFrame, selector: Vec<String>) -> Option<ContextFrame> {
        let context = self.execute_round(frame, &selector).await?;
        let frame = context.into_frame();
        let next = self.neighbor();
        if next == self.address() {
            return Some(frame);
        }
        match self.client.run(&next, frame.clone(), selector).await {
            Ok(Some(downstream)) => Some(downstream),
            Ok(None) => Some(frame),
            Err(e) => {
                warn!(node = %self.info(), %next, error = %e, round = %frame.round, "relay stopped");
                Some(frame)
            }
        }
    }

    /// Executes the round on this node without relaying and returns the
    /// contributions it added. `None` if the round was already processed.
    pub async fn contribute(&self, frame: ContextFrame, selector: &[String]) -> Option<Vec<Contribution>> {
        let before = frame.contributions.len();
        let mut context = self.execute_round(frame, selector).await?;
        Some(context.contributions.split_off(before))
    }

    async fn execute_round(&self, frame: ContextFrame, selector: &[String]) -> Option<ExecutionContext> {
        let units: Vec<WorkUnit> = {
            let mut state = self.state.lock().await;
            if !state.processed.insert(frame.round) {
                debug!(round = %frame.round, "round already processed");
                return None;
            }
            state
                .queue
                .iter()
                .filter(|unit| unit.is_selected(selector))
                .cloned()
                .collect()
        };

        let me = self.info();
        let mut context = ExecutionContext::from_frame(frame, me.clone());
        let span = tracing::debug_span!("round", round = %context.round, node = %me);
        async {
            for unit in &units {
                let outcome = match self.engine.execute(unit, &context).await {
                    Ok(text) => UnitOutcome::Completed(text),
                    Err(reason) => {
                        let err = Error::ExecutionFailure {
                            unit: unit.name.clone(),
                            reason: reason.clone(),
                        };
                        warn!("{}", err);
                        UnitOutcome::Failed(reason)
                    }
                };
                context.contributions.push(Contribution {
                    node: me.id,
                    address: me.address.clone(),
                    unit: unit.name.clone(),
                    outcome,
                });
            }
            context.stats.record(units.len() as u64);
            debug!(executed = units.len(), "round executed");
        }
        .instrument(span)
        .await;
        self.counters.rounds_executed.fetch_add(1, Ordering::Relaxed);
        Some(context)
    }
}

#[async_trait]
impl Service for PeerNode {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Info => Response::Info(self.info()),
            Request::QueueDepth => Response::Depth(self.queue_depth().await as u64),
            Request::Neighbor => Response::Neighbor(self.neighbor()),
            Request::RegionalQueueDepth | Request::SetRegionalNext(_) => {
                Response::Rejected(format!("{} is not a regional node", self.address()))
            }
            Request::ReceiveBlob(blob) => {
                self.receive_blob(blob).await;
                Response::Ack
            }
            Request::Balance(blob) => {
                self.balance(blob).await;
                Response::Ack
            }
            Request::SetNext(next) => {
                self.set_next(next);
                Response::Ack
            }
            Request::Run { context, selector } => Response::Ran(self.run(context, selector).await),
            Request::Contribute { context, selector } => {
                Response::Contribution(self.contribute(context, &selector).await)
            }
        }
    }
}
