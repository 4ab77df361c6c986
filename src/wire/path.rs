//! Network path and destination types for overlay routing
//!
//! A path is the ordered list of node ids a message has traversed,
//! origin first. Relays append themselves before forwarding, so the
//! receiving side can answer along the reverse path and every node can
//! learn where a peer lives from the hops in front of it.

use serde::{Deserialize, Serialize};

use crate::wire::ids::NodeId;

/// Ordered list of traversed hops, origin first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Path with the origin as its single hop.
    pub fn from_origin(origin: NodeId) -> Self {
        Self(vec![origin])
    }

    /// Append a hop. Paths only ever grow.
    pub fn push(&mut self, hop: NodeId) {
        self.0.push(hop);
    }

    /// Copy of this path with `hop` appended.
    pub fn with_hop(&self, hop: NodeId) -> Self {
        let mut next = self.clone();
        next.push(hop);
        next
    }

    /// First hop, i.e. the node the message originated from.
    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    /// Most recent hop.
    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }
}

impl From<Vec<NodeId>> for NetworkPath {
    fn from(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }
}

impl std::fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .0
            .iter()
            .map(NodeId::as_str)
            .collect::<Vec<_>>()
            .join(" > ");
        f.write_str(&joined)
    }
}

/// Where a request is headed.
///
/// `Node` targets a single node by id. `Route` pins the exact hop
/// sequence the sender wants the message to travel, final hop last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Destination {
    Node(NodeId),
    Route(Vec<NodeId>),
}

impl Destination {
    /// The node the message must ultimately reach.
    pub fn final_node(&self) -> Option<&NodeId> {
        match self {
            Destination::Node(id) => Some(id),
            Destination::Route(hops) => hops.last(),
        }
    }

    /// True when `node` is the final target.
    pub fn is_final(&self, node: &NodeId) -> bool {
        self.final_node().map(|id| id == node).unwrap_or(false)
    }

    /// For a pinned route, the hop that comes after `node`.
    pub fn next_hop_after(&self, node: &NodeId) -> Option<&NodeId> {
        match self {
            Destination::Node(_) => None,
            Destination::Route(hops) => {
                let pos = hops.iter().position(|h| h == node)?;
                hops.get(pos + 1)
            }
        }
    }
}

impl From<NodeId> for Destination {
    fn from(id: NodeId) -> Self {
        Destination::Node(id)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Node(id) => f.write_str(id.as_str()),
            Destination::Route(hops) => {
                let joined = hops
                    .iter()
                    .map(NodeId::as_str)
                    .collect::<Vec<_>>()
                    .join(" > ");
                f.write_str(&joined)
            }
        }
    }
}
