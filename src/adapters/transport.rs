//! Frame transport
//!
//! The one place where envelopes become bytes on a specific link.
//! Resolves the next hop (directly connected peer, learned route, or
//! the upstream CSMS as the default upward direction), appends this
//! node to the network path, and serializes in whatever framing the
//! chosen link speaks.

use std::sync::Arc;

use tracing::debug;

use crate::session::registry::PeerRegistry;
use crate::session::routes::RouteTable;
use crate::shared::errors::SendError;
use crate::wire::envelope::{ErrorEnvelope, RequestEnvelope, ResponseEnvelope};
use crate::wire::frame;
use crate::wire::frame::NetworkingMode;
use crate::wire::ids::NodeId;
use crate::wire::path::Destination;

pub struct NodeTransport {
    node_id: NodeId,
    peers: Arc<PeerRegistry>,
    routes: Arc<RouteTable>,
}

impl NodeTransport {
    pub fn new(node_id: NodeId, peers: Arc<PeerRegistry>, routes: Arc<RouteTable>) -> Self {
        Self { node_id, peers, routes }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Pick the link a request should leave on.
    ///
    /// Directly-connected destinations win; otherwise a learned route;
    /// otherwise the upstream CSMS link carries everything upward.
    pub fn resolve_next_hop(&self, destination: &Destination) -> Result<NodeId, SendError> {
        // A pinned route names the hop sequence explicitly.
        if let Destination::Route(hops) = destination {
            let next = destination
                .next_hop_after(&self.node_id)
                .or_else(|| hops.first())
                .cloned();
            if let Some(next) = next {
                return if self.peers.is_connected(&next) {
                    Ok(next)
                } else {
                    Err(SendError::PeerOffline(next))
                };
            }
        }

        let target = destination
            .final_node()
            .cloned()
            .ok_or_else(|| SendError::NoRoute(self.node_id.clone()))?;

        if self.peers.is_connected(&target) {
            return Ok(target);
        }
        if let Some(via) = self.routes.next_hop(&target) {
            if self.peers.is_connected(&via) {
                return Ok(via);
            }
        }
        if let Some(upstream) = self.peers.upstream() {
            return Ok(upstream);
        }
        Err(SendError::NoRoute(target))
    }

    /// Serialize and queue a request. Returns the chosen next hop.
    pub fn send_request(&self, envelope: &RequestEnvelope) -> Result<NodeId, SendError> {
        let next_hop = self.resolve_next_hop(&envelope.destination)?;
        let mode = self.peers.mode_of(&next_hop).unwrap_or_default();

        let outgoing = self.stamped_request(envelope);
        let text = frame::encode_request(&outgoing, mode);
        debug!(next_hop = %next_hop, action = %envelope.action, ?mode, "relaying request");
        self.peers.send_text(&next_hop, text)?;
        Ok(next_hop)
    }

    /// Serialize and queue a response for a specific link.
    pub fn send_response(&self, to: &NodeId, envelope: &ResponseEnvelope) -> Result<(), SendError> {
        let mode = self.peers.mode_of(to).unwrap_or_default();
        let outgoing = self.stamped_response(envelope);
        self.peers.send_text(to, frame::encode_response(&outgoing, mode))
    }

    /// Serialize and queue an error for a specific link.
    pub fn send_error(&self, to: &NodeId, envelope: &ErrorEnvelope) -> Result<(), SendError> {
        let mode = self.peers.mode_of(to).unwrap_or_default();
        let outgoing = self.stamped_error(envelope);
        self.peers.send_text(to, frame::encode_error(&outgoing, mode))
    }

    // Every frame leaving this node carries it as the last hop.

    fn stamped_request(&self, envelope: &RequestEnvelope) -> RequestEnvelope {
        let mut outgoing = envelope.clone();
        if outgoing.path.last() != Some(&self.node_id) {
            outgoing.path.push(self.node_id.clone());
        }
        outgoing
    }

    fn stamped_response(&self, envelope: &ResponseEnvelope) -> ResponseEnvelope {
        let mut outgoing = envelope.clone();
        if outgoing.path.last() != Some(&self.node_id) {
            outgoing.path.push(self.node_id.clone());
        }
        outgoing
    }

    fn stamped_error(&self, envelope: &ErrorEnvelope) -> ErrorEnvelope {
        let mut outgoing = envelope.clone();
        if outgoing.path.last() != Some(&self.node_id) {
            outgoing.path.push(self.node_id.clone());
        }
        outgoing
    }
}
