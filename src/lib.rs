//! orbit: a ring of autonomous worker nodes.
//!
//! Every [`PeerNode`] holds a queue of [`WorkUnit`]s and knows one neighbor.
//! Nodes periodically compare queue depths with their neighbor and push half
//! their queue across when they carry clearly more; rounds of execution run
//! either by fanning out to every member or by relaying around the ring.
//! Rings can themselves be joined into a regional ring through
//! [`RegionalNode`]s.

pub mod aggregate;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod hex;
pub mod identity;
pub mod net;
pub mod node;
pub mod ring;
pub mod work;

pub use aggregate::{AggregationMode, Coordinator, RoundReport};
pub use checkpoint::{Checkpoint, NodeSnapshot};
pub use codec::{Blob, CodecPolicy};
pub use config::NetworkConfig;
pub use engine::{DirectiveEngine, ExecutionEngine};
pub use error::{Error, Result};
pub use identity::{Keypair, NodeIdentity};
pub use net::{PeerClient, Transport};
pub use node::{NodeOptions, PeerNode, RegionalNode, TickOutcome};
pub use work::{ContextFrame, ExecutionContext, WorkUnit};
