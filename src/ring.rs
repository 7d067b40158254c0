//! Ring membership: insertion, traversal and offline topology checks.
//!
//! Membership lives entirely in the nodes' `next` pointers. Nothing here
//! coordinates concurrent writers: two insertions racing on the same anchor
//! can fork the ring, so callers serialize membership changes themselves.

use futures::{stream, Stream, TryStreamExt};
use hashbrown::HashMap;
use petgraph::{algo::kosaraju_scc, graph::NodeIndex, Direction, Graph};

use crate::{
    checkpoint::Checkpoint,
    config::NodePlan,
    error::{Error, Result},
    net::PeerClient,
};

/// Splices `new` into the ring right after `anchor`: first
/// `new.next = anchor.next`, then `anchor.next = new`.
pub async fn insert_after(client: &PeerClient, anchor: &str, new: &str) -> Result<()> {
    let after = client.neighbor(anchor).await?;
    client.set_next(new, &after).await?;
    client.set_next(anchor, new).await?;
    Ok(())
}

enum Cursor {
    Start,
    After(String),
    Finished,
}

/// Walks the ring from `start` following `next` pointers.
///
/// Yields `start` first and ends right before `start` would come up again.
/// If more than `cap` members go by without closing the loop the walk yields
/// [`Error::RingIntegrity`] and ends; a peer that cannot be asked for its
/// neighbor ends the walk with that error.
pub fn traverse(
    client: PeerClient,
    start: impl Into<String>,
    cap: usize,
) -> impl Stream<Item = Result<String>> + Send {
    let start = start.into();
    stream::unfold((Cursor::Start, 0usize), move |(cursor, visited)| {
        let client = client.clone();
        let start = start.clone();
        async move {
            match cursor {
                Cursor::Finished => None,
                Cursor::Start => Some((Ok(start.clone()), (Cursor::After(start), 1))),
                Cursor::After(current) => match client.neighbor(&current).await {
                    Err(e) => Some((Err(e.into()), (Cursor::Finished, visited))),
                    Ok(next) if next == start => None,
                    Ok(_) if visited >= cap => {
                        Some((Err(Error::RingIntegrity { start, cap }), (Cursor::Finished, visited)))
                    }
                    Ok(next) => Some((Ok(next.clone()), (Cursor::After(next), visited + 1))),
                },
            }
        }
    })
}

/// Every member of the ring containing `start`, in traversal order.
pub async fn collect_members(client: &PeerClient, start: &str, cap: usize) -> Result<Vec<String>> {
    traverse(client.clone(), start, cap).try_collect().await
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("{0} appears more than once")]
    DuplicateMember(String),
    #[error("{from} points at unknown member {to}")]
    UnknownSuccessor { from: String, to: String },
    #[error("{0} is not on a cycle")]
    Dangling(String),
}

/// An offline view of the rings: one `address -> next` edge per member.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    edges: Vec<(String, String)>,
}

impl Topology {
    pub fn new(edges: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            edges: edges.into_iter().collect(),
        }
    }

    pub fn from_plan(plan: &[NodePlan]) -> Self {
        Self::new(plan.iter().map(|p| (p.address.clone(), p.next.clone())))
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self::new(
            checkpoint
                .nodes
                .iter()
                .map(|n| (n.identity.address.clone(), n.next.clone())),
        )
    }

    /// The regional tier: `address -> regional next` for every member that
    /// has one.
    pub fn regional_from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self::new(checkpoint.nodes.iter().filter_map(|n| {
            n.regional_next
                .clone()
                .map(|next| (n.identity.address.clone(), next))
        }))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Splits the members into rings, each listed in traversal order from
    /// its first member in insertion order. Fails unless every member has
    /// exactly one known successor and lies on a cycle.
    pub fn rings(&self) -> Result<Vec<Vec<String>>, TopologyError> {
        let mut graph = Graph::<&str, ()>::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for (from, _) in &self.edges {
            if index.insert(from.as_str(), graph.add_node(from.as_str())).is_some() {
                return Err(TopologyError::DuplicateMember(from.clone()));
            }
        }
        for (from, to) in &self.edges {
            let target = index
                .get(to.as_str())
                .ok_or_else(|| TopologyError::UnknownSuccessor {
                    from: from.clone(),
                    to: to.clone(),
                })?;
            graph.add_edge(index[from.as_str()], *target, ());
        }
        // one successor each, so every member is on a cycle iff every member
        // also has exactly one predecessor
        if let Some(node) = graph
            .node_indices()
            .find(|&n| graph.neighbors_directed(n, Direction::Incoming).count() != 1)
        {
            return Err(TopologyError::Dangling(graph[node].to_string()));
        }

        let mut rings: Vec<Vec<String>> = kosaraju_scc(&graph)
            .into_iter()
            .map(|component| {
                let first = component.iter().copied().min().unwrap_or_default();
                let mut ring = Vec::with_capacity(component.len());
                let mut cursor = first;
                loop {
                    ring.push(graph[cursor].to_string());
                    cursor = match graph.neighbors(cursor).next() {
                        Some(next) if next != first => next,
                        _ => break,
                    };
                }
                ring
            })
            .collect();
        rings.sort_by_key(|ring| ring.first().and_then(|a| index.get(a.as_str())).copied());
        Ok(rings)
    }

    /// True if the members form exactly one ring.
    pub fn is_single_ring(&self) -> bool {
        matches!(self.rings(), Ok(rings) if rings.len() == 1)
    }
}
