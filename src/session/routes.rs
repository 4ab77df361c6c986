//! Route learning and response relay tables
//!
//! Two small concurrent maps keep multi-hop traffic flowing:
//!
//! - the **route table** remembers which directly-connected peer leads
//!   to a node that is not itself directly connected, learned from the
//!   network paths of passing frames;
//! - the **relay table** remembers, per in-flight relayed request,
//!   which link the eventual response must be written back to.

use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Duration;
use tracing::debug;

use crate::wire::ids::{NodeId, RequestId};
use crate::wire::path::NetworkPath;

// ── RouteTable ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub via: NodeId,
    pub learned_at: DateTime<Utc>,
}

/// Learned reachability: node -> directly-connected peer leading to it.
#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<NodeId, RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` is reachable through `via`. Returns true when
    /// this is new information (a new node, or a changed next hop).
    pub fn learn(&self, node: NodeId, via: NodeId) -> bool {
        let mut changed = true;
        self.routes
            .entry(node)
            .and_modify(|entry| {
                if entry.via == via {
                    changed = false;
                } else {
                    entry.via = via.clone();
                    entry.learned_at = Utc::now();
                }
            })
            .or_insert_with(|| RouteEntry {
                via,
                learned_at: Utc::now(),
            });
        changed
    }

    /// Learn every hop of a traversed path as reachable through the
    /// link the frame arrived on. Returns the nodes that were news.
    pub fn learn_from_path(
        &self,
        path: &NetworkPath,
        arrived_via: &NodeId,
        self_id: &NodeId,
    ) -> Vec<NodeId> {
        let mut learned = Vec::new();
        for hop in path.hops() {
            if hop == self_id || hop == arrived_via {
                continue;
            }
            if self.learn(hop.clone(), arrived_via.clone()) {
                debug!(node = %hop, via = %arrived_via, "route learned");
                learned.push(hop.clone());
            }
        }
        learned
    }

    /// Next hop towards `node`, when one has been learned.
    pub fn next_hop(&self, node: &NodeId) -> Option<NodeId> {
        self.routes.get(node).map(|entry| entry.via.clone())
    }

    /// Drop every route that goes through `via`, e.g. when that link
    /// closes.
    pub fn forget_via(&self, via: &NodeId) -> usize {
        let doomed: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|entry| &entry.via == via)
            .map(|entry| entry.key().clone())
            .collect();
        let count = doomed.len();
        for node in doomed {
            self.routes.remove(&node);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ── RelayTable ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayEntry {
    /// Link the response must be written back to.
    pub origin: NodeId,
    pub action: String,
    inserted_at: Instant,
}

/// Back-routes for responses to requests this node relayed.
#[derive(Default)]
pub struct RelayTable {
    entries: DashMap<RequestId, RelayEntry>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember where the response to `request_id` must go. Fails when
    /// the id is already relaying, which would make the back-route
    /// ambiguous.
    pub fn remember(
        &self,
        request_id: RequestId,
        origin: NodeId,
        action: impl Into<String>,
    ) -> Result<(), RelayCollision> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(request_id.clone()) {
            Entry::Occupied(_) => Err(RelayCollision(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(RelayEntry {
                    origin,
                    action: action.into(),
                    inserted_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Consume the back-route for a response. The first response wins;
    /// a duplicate finds nothing.
    pub fn take(&self, request_id: &RequestId) -> Option<RelayEntry> {
        self.entries.remove(request_id).map(|(_, entry)| entry)
    }

    /// Drop entries older than `ttl`, returning how many went.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let doomed: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|entry| entry.inserted_at.elapsed() > ttl)
            .map(|entry| entry.key().clone())
            .collect();
        let count = doomed.len();
        for id in doomed {
            self.entries.remove(&id);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A relayed request id is already awaiting its response.
#[derive(Debug, thiserror::Error)]
#[error("request id {0} is already being relayed")]
pub struct RelayCollision(pub RequestId);
